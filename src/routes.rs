mod execute;
mod playground;

pub use execute::*;
pub use playground::*;

use std::fmt;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, web};
use serde::{Deserialize, Serialize};

use crate::error::JudgeError;
use crate::session::SessionManager;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
    message: String,
}

/// Problem and user ids arrive either as strings or as numbers
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Identifier {
    Text(String),
    Number(u64),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
        message: err.to_string(),
    });
    InternalError::from_response(err, response).into()
}

pub(crate) fn error_response(err: &JudgeError) -> HttpResponse {
    let (mut builder, reason, code) = match err {
        JudgeError::InvalidRequest(_) => (HttpResponse::BadRequest(), "ERR_INVALID_ARGUMENT", 1),
        JudgeError::SessionClosed(_) | JudgeError::InputBacklog(_) | JudgeError::Cancelled => {
            (HttpResponse::Conflict(), "ERR_INVALID_STATE", 2)
        }
        JudgeError::SessionNotFound(_) | JudgeError::ProblemNotFound(_) => {
            (HttpResponse::NotFound(), "ERR_NOT_FOUND", 3)
        }
        JudgeError::Overloaded => (HttpResponse::ServiceUnavailable(), "ERR_OVERLOADED", 4),
        _ => {
            log::error!("Request failed: {err}");
            (HttpResponse::InternalServerError(), "ERR_INTERNAL", 6)
        }
    };
    builder.json(ErrorResponse {
        reason,
        code,
        message: err.to_string(),
    })
}

#[get("/status")]
pub async fn get_status(manager: web::Data<SessionManager>) -> impl Responder {
    HttpResponse::Ok().json(manager.stats().await)
}

/// Registers every judge endpoint; mounted under `/api/v1` by the server
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(post_execute)
        .service(post_submit)
        .service(post_playground_start)
        .service(get_playground_poll)
        .service(post_playground_input)
        .service(post_playground_stop)
        .service(post_playground_execute)
        .service(get_status);
}
