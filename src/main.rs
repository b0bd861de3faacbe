// ==========================================
// 医院业务价值核算 - 命令行入口
// ==========================================
// 职责: 建库、创建/执行任务、查询状态/日志/结果、结果校验
// 数据库: --db 参数 > HOSPITAL_VALUE_DB_PATH > 用户数据目录
// ==========================================

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hospital_value_calc::api::CalculationApi;
use hospital_value_calc::db::{default_db_path, init_reference_schema, init_schema, open_sqlite_connection};
use hospital_value_calc::engine::TaskScheduler;
use hospital_value_calc::{logging, TaskStatus, APP_NAME, VERSION};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Parser)]
#[command(name = "hospital-value-calc")]
#[command(about = "医院业务价值核算 - 计算流程引擎")]
struct Cli {
    /// 数据库文件路径
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 初始化引擎表结构
    InitDb {
        /// 同时创建参考数据表 (工作量/导向/学科/成本)
        #[arg(long)]
        with_reference: bool,
    },
    /// 创建计算任务
    CreateTask {
        #[arg(long)]
        model_version_id: i64,
        #[arg(long)]
        workflow_id: i64,
        #[arg(long)]
        period: String,
        #[arg(long)]
        organization_id: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// 执行单个任务
    RunTask { task_id: String },
    /// 并发执行多个任务
    RunBatch {
        #[arg(required = true)]
        task_ids: Vec<String>,
        #[arg(long, default_value_t = 4)]
        max_concurrency: usize,
    },
    /// 任务列表
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        model_version_id: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// 任务状态
    Status { task_id: String },
    /// 步骤日志
    Logs { task_id: String },
    /// 结果行
    Results {
        task_id: String,
        #[arg(long)]
        unit_id: Option<i64>,
    },
    /// 分类汇总
    Summary {
        task_id: String,
        #[arg(long)]
        unit_id: Option<i64>,
    },
    /// 结果一致性校验
    Verify { task_id: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_api(db_path: &str) -> Result<CalculationApi> {
    let conn = open_sqlite_connection(db_path)
        .with_context(|| format!("无法打开数据库: {}", db_path))?;
    Ok(CalculationApi::new(Arc::new(Mutex::new(conn))))
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    tracing::debug!(app = APP_NAME, version = VERSION, db_path = %db_path, "启动");

    match cli.command {
        Command::InitDb { with_reference } => {
            let conn = open_sqlite_connection(&db_path)
                .with_context(|| format!("无法打开数据库: {}", db_path))?;
            init_schema(&conn)?;
            if with_reference {
                init_reference_schema(&conn)?;
            }
            println!("数据库已初始化: {}", db_path);
        }
        Command::CreateTask {
            model_version_id,
            workflow_id,
            period,
            organization_id,
            description,
        } => {
            let task_id = open_api(&db_path)?.create_task(
                model_version_id,
                workflow_id,
                &period,
                &organization_id,
                description.as_deref(),
            )?;
            println!("{}", task_id);
        }
        Command::RunTask { task_id } => {
            let outcome = TaskScheduler::new(&db_path).run_task(&task_id).await?;
            print_json(&outcome)?;
            if outcome.status != TaskStatus::Completed {
                bail!("任务 {} 执行失败", task_id);
            }
        }
        Command::RunBatch {
            task_ids,
            max_concurrency,
        } => {
            let results = TaskScheduler::new(&db_path)
                .with_max_concurrency(max_concurrency)
                .run_batch(task_ids)
                .await?;
            let mut failed = 0usize;
            for (task_id, result) in results {
                match result {
                    Ok(outcome) => {
                        if outcome.status != TaskStatus::Completed {
                            failed += 1;
                        }
                        print_json(&outcome)?;
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {}", task_id, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} 个任务未完成", failed);
            }
        }
        Command::List {
            status,
            model_version_id,
            limit,
        } => {
            let status = match status.as_deref() {
                Some(raw) => Some(
                    TaskStatus::from_db_str(raw)
                        .with_context(|| format!("未知任务状态: {}", raw))?,
                ),
                None => None,
            };
            print_json(&open_api(&db_path)?.list_tasks(status, model_version_id, limit)?)?;
        }
        Command::Status { task_id } => {
            print_json(&open_api(&db_path)?.get_task_status(&task_id)?)?;
        }
        Command::Logs { task_id } => {
            print_json(&open_api(&db_path)?.get_step_logs(&task_id)?)?;
        }
        Command::Results { task_id, unit_id } => {
            print_json(&open_api(&db_path)?.get_results(&task_id, unit_id)?)?;
        }
        Command::Summary { task_id, unit_id } => {
            print_json(&open_api(&db_path)?.get_summary(&task_id, unit_id)?)?;
        }
        Command::Verify { task_id } => {
            let report = open_api(&db_path)?.verify_task(&task_id)?;
            print_json(&report)?;
            if !report.is_consistent() {
                bail!("任务 {} 结果不一致", task_id);
            }
        }
    }
    Ok(())
}
