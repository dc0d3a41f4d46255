//! AWS-backed implementations of the job and object store traits.

mod bedrock;
mod s3;

pub use bedrock::{BedrockJobService, BedrockJobServiceBuilder};
pub use s3::S3ObjectStore;

use crate::error::ReelWatchError;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_smithy_types::{Document, Number};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Region used when neither the builder nor `AWS_REGION` names one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Loads the shared AWS configuration.
///
/// Region resolution: explicit `region`, then the SDK default chain
/// (`AWS_REGION`, profile), then [`DEFAULT_REGION`].
pub async fn load_sdk_config(region: Option<String>) -> aws_config::SdkConfig {
    let region = RegionProviderChain::first_try(region.map(Region::new))
        .or_default_provider()
        .or_else(Region::new(DEFAULT_REGION));
    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .load()
        .await
}

/// Maps an SDK failure to the crate error, keyed on the service error code.
pub(crate) fn sdk_error<E>(operation: &str, err: SdkError<E>) -> ReelWatchError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return ReelWatchError::Network(format!("{operation}: {}", DisplayErrorContext(&err)));
        }
        _ => {}
    }
    let status = err
        .raw_response()
        .map(|r| r.status().as_u16())
        .unwrap_or_default();
    let message = err
        .message()
        .map(str::to_owned)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    classify(err.code(), status, format!("{operation}: {message}"))
}

fn classify(code: Option<&str>, status: u16, message: String) -> ReelWatchError {
    match code {
        Some(
            "ThrottlingException"
            | "ServiceQuotaExceededException"
            | "TooManyRequestsException"
            | "SlowDown",
        ) => ReelWatchError::RateLimited { retry_after: None },
        Some(
            "AccessDeniedException"
            | "AccessDenied"
            | "UnrecognizedClientException"
            | "ExpiredTokenException"
            | "InvalidAccessKeyId",
        ) => ReelWatchError::Auth(message),
        Some("ValidationException" | "InvalidBucketName") => {
            ReelWatchError::InvalidRequest(message)
        }
        Some(
            "ServiceUnavailableException"
            | "InternalServerException"
            | "ServiceUnavailable"
            | "InternalError",
        ) => ReelWatchError::Network(message),
        _ if status == 429 => ReelWatchError::RateLimited { retry_after: None },
        _ if status >= 500 => ReelWatchError::Network(message),
        _ => ReelWatchError::Api { status, message },
    }
}

pub(crate) fn to_chrono(dt: &aws_smithy_types::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

pub(crate) fn to_smithy(dt: &DateTime<Utc>) -> aws_smithy_types::DateTime {
    aws_smithy_types::DateTime::from_secs_and_nanos(dt.timestamp(), dt.timestamp_subsec_nanos())
}

/// Converts a JSON payload into the SDK's document type.
pub(crate) fn to_document(value: &serde_json::Value) -> Document {
    match value {
        serde_json::Value::Null => Document::Null,
        serde_json::Value::Bool(b) => Document::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(Number::NegInt(i))
            } else {
                Document::Number(Number::Float(n.as_f64().unwrap_or_default()))
            }
        }
        serde_json::Value::String(s) => Document::String(s.clone()),
        serde_json::Value::Array(items) => Document::Array(items.iter().map(to_document).collect()),
        serde_json::Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_document(v)))
                .collect::<HashMap<_, _>>(),
        ),
    }
}
