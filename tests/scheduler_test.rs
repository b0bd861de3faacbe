// ==========================================
// 任务调度测试
// ==========================================
// 场景: 单任务异步执行、批量并发执行、重复启动、配置读取
// ==========================================


use hospital_value_calc::api::{CalculationApi, WorkflowApi};
use hospital_value_calc::config::{config_keys, ConfigManager, EngineConfigReader, EngineSettings};
use hospital_value_calc::engine::{EngineError, TaskScheduler};
use hospital_value_calc::TaskStatus;
use test_helpers::*;

#[tokio::test]
async fn test_run_batch_executes_tasks_independently() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    let scenario = seed_scenario(conn.clone(), vec![]);
    add_discipline_rule(&conn.lock().unwrap(), scenario.version_id, "U1", "L", 0.8);

    let workflow_api = WorkflowApi::new(conn.clone());
    let calc_api = CalculationApi::new(conn.clone());
    let (workflow_id, _) = build_workflow(&workflow_api, scenario.version_id, &standard_steps());
    let task_ids: Vec<String> = (0..3)
        .map(|_| create_task(&calc_api, &scenario, workflow_id))
        .collect();

    let results = TaskScheduler::new(&db_path)
        .with_max_concurrency(3)
        .run_batch(task_ids.clone())
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    for ((task_id, result), expected) in results.iter().zip(&task_ids) {
        assert_eq!(task_id, expected);
        let outcome = result.as_ref().unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed, "{:?}", outcome);

        // 结果按 task_id 分区,互不影响
        let rows = calc_api.get_results(task_id, None).unwrap();
        assert_eq!(rows.len(), 2);
        let leaf = rows.iter().find(|r| r.node_id == scenario.leaf_id).unwrap();
        assert!((leaf.value - 800.0).abs() < 1e-9);
        assert_eq!(calc_api.get_step_logs(task_id).unwrap().len(), 4);
        assert!(calc_api.verify_task(task_id).unwrap().is_consistent());
    }
}

#[tokio::test]
async fn test_task_cannot_run_twice() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    let scenario = seed_scenario(conn.clone(), vec![]);
    let workflow_api = WorkflowApi::new(conn.clone());
    let calc_api = CalculationApi::new(conn.clone());
    let (workflow_id, _) = build_workflow(&workflow_api, scenario.version_id, &standard_steps());
    let task_id = create_task(&calc_api, &scenario, workflow_id);

    let scheduler = TaskScheduler::new(&db_path);
    let first = scheduler.run_task(&task_id).await.unwrap();
    assert_eq!(first.status, TaskStatus::Completed);

    match scheduler.run_task(&task_id).await {
        Err(EngineError::InvalidStateTransition { from, .. }) => assert_eq!(from, "completed"),
        other => panic!("unexpected: {:?}", other),
    }
    // 第二次启动不追加日志
    assert_eq!(calc_api.get_step_logs(&task_id).unwrap().len(), 4);
}

#[tokio::test]
async fn test_unknown_task_is_reported() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let result = TaskScheduler::new(&db_path).run_task("missing").await;
    assert!(matches!(result, Err(EngineError::TaskNotFound(_))));
}

#[tokio::test]
async fn test_config_reader_defaults_and_overrides() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let config = ConfigManager::new(&db_path).unwrap();
    assert_eq!(
        EngineSettings::load(&config).await.unwrap(),
        EngineSettings::default()
    );

    config
        .set_global_config_value(config_keys::STEP_TIMEOUT_MS, "1500")
        .unwrap();
    config
        .set_global_config_value(config_keys::PROGRESS_PRECISION, "0")
        .unwrap();
    assert_eq!(config.get_step_timeout_ms().await.unwrap(), 1500);
    let settings = EngineSettings::load(&config).await.unwrap();
    assert_eq!(settings.progress_precision, 0);
    assert_eq!(settings.round_progress(100.0 / 3.0), 33.0);
}
