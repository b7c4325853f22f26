use crate::types::StatusEvent;
use actix_web::HttpResponse;
use anyhow::Result;
use log::error;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// JSON envelope `{status, data?, message?}` consumed by the panel page
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn data(data: T) -> Self {
        Envelope {
            status: ResponseStatus::Success,
            data: Some(data),
            message: None,
        }
    }
}

impl Envelope<()> {
    pub fn success(message: impl Into<String>) -> Self {
        Envelope {
            status: ResponseStatus::Success,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope {
            status: ResponseStatus::Error,
            data: None,
            message: Some(message.into()),
        }
    }
}

/// Trait for converting service results into HTTP responses
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for Vec<StatusEvent> {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().json(self)
    }
}

impl<T: Serialize> ServiceResultResponse for Envelope<T> {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().json(self)
    }
}

/// Handle Result and convert it into a Response
///
/// Successful data is put into its ServiceResultResponse. An error is logged
/// and answered with an error envelope carrying the full error chain.
///
/// # Arguments
/// * `result` - The Result to handle
/// * `operation` - Context message describing the operation
///
/// # Returns
/// * `HttpResponse` - The ServiceResultResponse (HttpResponse::Ok or HttpResponse::InternalServerError)
pub fn handle_service_result<T>(result: Result<T>, operation: &str) -> HttpResponse
where
    T: ServiceResultResponse,
{
    match result {
        Ok(data) => data.into_response(),
        Err(e) => {
            error!("{operation} failed: {e:#}");
            HttpResponse::InternalServerError().json(Envelope::error(format!("{e:#}")))
        }
    }
}
