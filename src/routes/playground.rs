use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use super::error_response;
use super::execute::respond;
use crate::harness::TestData;
use crate::language::Language;
use crate::session::{ExecutionRequest, LimitProfile, Mode, SessionManager};

#[derive(Deserialize, Debug)]
pub struct StartBody {
    pub language: Language,
    pub code: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StartResponse {
    pub session_id: String,
}

#[derive(Deserialize, Debug)]
pub struct InputBody {
    pub input: String,
}

#[derive(Deserialize, Debug)]
pub struct PlaygroundExecuteBody {
    pub language: Language,
    pub code: String,
    pub stdin: Option<String>,
}

#[post("/playground/start")]
pub async fn post_playground_start(
    manager: web::Data<SessionManager>,
    body: web::Json<StartBody>,
) -> impl Responder {
    let StartBody { language, code } = body.into_inner();
    let request = ExecutionRequest {
        language,
        source_code: code,
        driver_code: None,
        test_data: None,
        mode: Mode::Interactive,
        limits: LimitProfile::Playground,
    };

    match manager.start(request).await {
        Ok(session_id) => HttpResponse::Ok().json(StartResponse { session_id }),
        Err(e) => error_response(&e),
    }
}

#[get("/playground/poll/{session_id}")]
pub async fn get_playground_poll(
    manager: web::Data<SessionManager>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let session_id = path.into_inner().0;
    match manager.poll(&session_id) {
        Ok(poll) => HttpResponse::Ok().json(poll),
        Err(e) => error_response(&e),
    }
}

#[post("/playground/input/{session_id}")]
pub async fn post_playground_input(
    manager: web::Data<SessionManager>,
    path: web::Path<(String,)>,
    body: web::Json<InputBody>,
) -> impl Responder {
    let session_id = path.into_inner().0;
    match manager.send_input(&session_id, body.into_inner().input) {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}

#[post("/playground/stop/{session_id}")]
pub async fn post_playground_stop(
    manager: web::Data<SessionManager>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let session_id = path.into_inner().0;
    match manager.cancel(&session_id).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(&e),
    }
}

/// One-shot run of playground code with its whole stdin up front
#[post("/playground/execute")]
pub async fn post_playground_execute(
    manager: web::Data<SessionManager>,
    body: web::Json<PlaygroundExecuteBody>,
) -> impl Responder {
    let PlaygroundExecuteBody {
        language,
        code,
        stdin,
    } = body.into_inner();
    log::info!("Received playground execution in {language}");

    let request = ExecutionRequest {
        language,
        source_code: code,
        driver_code: None,
        test_data: stdin.map(TestData::Raw),
        mode: Mode::Batch,
        limits: LimitProfile::Playground,
    };
    respond(manager.execute(request).await)
}
