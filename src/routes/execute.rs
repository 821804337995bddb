use actix_web::{HttpResponse, Responder, post, web};
use serde::Deserialize;

use super::{Identifier, error_response};
use crate::error::Result;
use crate::harness::TestData;
use crate::judge::ExecutionReport;
use crate::language::Language;
use crate::problems::ProblemStore;
use crate::session::{ExecutionRequest, LimitProfile, Mode, SessionManager};

#[derive(Deserialize, Debug)]
pub struct ExecuteBody {
    pub language: Language,
    pub code: String,
    pub problem_id: Option<Identifier>,
    /// Accepted and logged only
    pub user_id: Option<Identifier>,
    pub driver_code: Option<String>,
    pub test_data: Option<TestData>,
}

#[post("/execute")]
pub async fn post_execute(
    manager: web::Data<SessionManager>,
    problems: web::Data<ProblemStore>,
    body: web::Json<ExecuteBody>,
) -> impl Responder {
    respond(judge_submission("execute", &manager, &problems, body.into_inner()).await)
}

#[post("/submit")]
pub async fn post_submit(
    manager: web::Data<SessionManager>,
    problems: web::Data<ProblemStore>,
    body: web::Json<ExecuteBody>,
) -> impl Responder {
    respond(judge_submission("submit", &manager, &problems, body.into_inner()).await)
}

pub(super) fn respond(result: Result<ExecutionReport>) -> HttpResponse {
    match result {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(&e),
    }
}

/// Inline driver and test data win over what is stored for the problem
async fn judge_submission(
    action: &str,
    manager: &SessionManager,
    problems: &ProblemStore,
    body: ExecuteBody,
) -> Result<ExecutionReport> {
    let ExecuteBody {
        language,
        code,
        problem_id,
        user_id,
        mut driver_code,
        mut test_data,
    } = body;

    if let Some(problem_id) = &problem_id
        && (driver_code.is_none() || test_data.is_none())
    {
        let stored = problems.load(&problem_id.to_string(), language)?;
        driver_code = driver_code.or(stored.driver_code);
        test_data = test_data.or(stored.test_data);
    }

    log::info!(
        "Received {action} in {language} for problem {} from user {}",
        problem_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
        user_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
    );

    let report = manager
        .execute(ExecutionRequest {
            language,
            source_code: code,
            driver_code,
            test_data,
            mode: Mode::Batch,
            limits: LimitProfile::Judge,
        })
        .await?;
    log::info!(
        "{action} finished with {:?} (verdict {:?})",
        report.status,
        report.verdict
    );
    Ok(report)
}
