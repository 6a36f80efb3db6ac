use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Parse(#[from] strum::ParseError),

    #[error(transparent)]
    Multipart(#[from] axum::extract::multipart::MultipartError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error("{0} not found")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Parse(_) | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Json(_) | ApiError::Multipart(_) => StatusCode::BAD_REQUEST,
            ApiError::Io(_) | ApiError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl serde::Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::tabs::Tab;

    #[test]
    fn unknown_tabs_are_not_found() {
        let err: ApiError = Tab::from_str("nope").unwrap_err().into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            serde_json::to_string(&ApiError::NotFound("upload".into())).ok().as_deref(),
            Some("\"upload not found\"")
        );
    }
}
