// ==========================================
// 步骤超时测试
// ==========================================
// 场景: 配置的单步骤超时中断长时间运行的 SQL,任务失败并记录 timeout
// ==========================================


use hospital_value_calc::api::{CalculationApi, WorkflowApi};
use hospital_value_calc::config::{config_keys, ConfigManager};
use hospital_value_calc::engine::TaskScheduler;
use hospital_value_calc::{NewCalculationStep, TaskStatus};
use std::time::Instant;
use test_helpers::*;

const ENDLESS_SQL: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                           SELECT COUNT(*) FROM c";

#[tokio::test]
async fn test_step_timeout_fails_task() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    let scenario = seed_scenario(conn.clone(), vec![]);
    ConfigManager::from_connection(conn.clone())
        .unwrap()
        .set_global_config_value(config_keys::STEP_TIMEOUT_MS, "100")
        .unwrap();

    let workflow_api = WorkflowApi::new(conn.clone());
    let calc_api = CalculationApi::new(conn.clone());
    let steps = vec![
        NewCalculationStep::script("末级工作量", LEAF_SCRIPT),
        NewCalculationStep::sql("失控查询", ENDLESS_SQL),
        NewCalculationStep::script("汇总", ROLLUP_SCRIPT),
    ];
    let (workflow_id, step_ids) = build_workflow(&workflow_api, scenario.version_id, &steps);
    let task_id = create_task(&calc_api, &scenario, workflow_id);

    let started = Instant::now();
    let outcome = TaskScheduler::new(&db_path).run_task(&task_id).await.unwrap();
    assert!(started.elapsed().as_secs() < 30);

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.failed_step_id, Some(step_ids[1]));
    assert!(outcome
        .error_message
        .as_deref()
        .unwrap()
        .contains("执行超时: 超过 100 ms"));

    let logs = calc_api.get_step_logs(&task_id).unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].result_payload.as_ref().unwrap()["error_kind"], "timeout");

    // 超时步骤已回滚,前一步骤结果保留
    assert_eq!(calc_api.get_results(&task_id, None).unwrap().len(), 1);
}

#[test]
fn test_zero_timeout_disables_limit() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    let scenario = seed_scenario(conn.clone(), vec![]);
    ConfigManager::from_connection(conn.clone())
        .unwrap()
        .set_global_config_value(config_keys::STEP_TIMEOUT_MS, "0")
        .unwrap();

    let workflow_api = WorkflowApi::new(conn.clone());
    let calc_api = CalculationApi::new(conn.clone());
    let steps = vec![NewCalculationStep::sql(
        "有限递归",
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000) \
         SELECT COUNT(*) FROM c",
    )];
    let (workflow_id, _) = build_workflow(&workflow_api, scenario.version_id, &steps);
    let task_id = create_task(&calc_api, &scenario, workflow_id);

    let outcome = calc_api.run_task(&task_id).unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed, "{:?}", outcome);
}
