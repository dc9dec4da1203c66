use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    UnknownJob,
    InvalidPayload,
}

/// Structured rejection of a `(job name, payload)` pair.
///
/// `path` points at the offending field using dotted notation (`data.items[2].sku`),
/// or `.` when the problem is with the payload as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{job_name} at `{path}`: {reason}")]
pub struct ValidationError {
    pub job_name: String,
    pub kind: ValidationErrorKind,
    pub path: String,
    pub reason: String,
}

impl ValidationError {
    pub fn unknown_job(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            kind: ValidationErrorKind::UnknownJob,
            path: ".".to_string(),
            reason: format!("unknown job `{job_name}`"),
        }
    }

    pub fn invalid(job_name: &str, path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            job_name: job_name.to_string(),
            kind: ValidationErrorKind::InvalidPayload,
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Decodes `payload` into `T`, rejecting missing, mistyped and unexpected fields.
///
/// Unexpected fields are the ones serde skips while decoding, so payload types do
/// not need `#[serde(deny_unknown_fields)]`.
pub fn decode_payload<T>(job_name: &str, payload: Value) -> Result<T, ValidationError>
where
    T: DeserializeOwned,
{
    let mut unexpected = vec![];
    let mut skipped = |path: serde_ignored::Path<'_>| unexpected.push(field_path(&path));
    let deserializer = serde_ignored::Deserializer::new(payload, &mut skipped);

    let decoded: T = serde_path_to_error::deserialize(deserializer).map_err(|e| {
        let path = e.path().to_string();
        ValidationError::invalid(job_name, path, e.into_inner().to_string())
    })?;

    match unexpected.into_iter().next() {
        Some(path) => Err(ValidationError::invalid(job_name, path, "unexpected field")),
        None => Ok(decoded),
    }
}

/// Renders a skipped field as `data.items[2].sku`, the notation used for decode errors.
fn field_path(path: &serde_ignored::Path<'_>) -> String {
    match path {
        serde_ignored::Path::Root => String::new(),
        serde_ignored::Path::Seq { parent, index } => format!("{}[{index}]", field_path(parent)),
        serde_ignored::Path::Map { parent, key } => {
            let parent = field_path(parent);
            if parent.is_empty() {
                key.clone()
            } else {
                format!("{parent}.{key}")
            }
        }
        serde_ignored::Path::Some { parent }
        | serde_ignored::Path::NewtypeStruct { parent }
        | serde_ignored::Path::NewtypeVariant { parent } => field_path(parent),
    }
}
