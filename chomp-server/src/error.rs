//! JSON error responses for the retriever API. Grounded on
//! `examples/original_source/src/server/responses.py::error_response`'s
//! `{code, message}` body shape, and on the teacher's own `ApiError`
//! `Responder` impl (`mmoldb-app/src/api/error.rs`) for the Rocket wiring.

use std::io::Cursor;

use log::error;
use rocket::http::{ContentType, Status};
use rocket::response::Responder;
use rocket::{Request, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("resource(s) not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Coordination(#[from] chomp_core::CoordinationError),
    #[error(transparent)]
    Tsdb(#[from] chomp_tsdb::TsdbError),
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::Coordination(_) | ApiError::Tsdb(_) => Status::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::NotFound("x".into()).status(), Status::NotFound);
        assert_eq!(ApiError::BadRequest("x".into()).status(), Status::BadRequest);
    }

    #[test]
    fn not_found_message_includes_resource_name() {
        let e = ApiError::NotFound("btc_price".to_string());
        assert!(e.to_string().contains("btc_price"));
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        error!("api error: {self}");
        let body = serde_json::to_string(&ErrorBody { code: status.code, message: self.to_string() })
            .unwrap_or_else(|_| "{\"code\":500,\"message\":\"internal error\"}".to_string());
        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
