//! Status handling shared by the JSON/HTTP adapters.

use reqwest::{Response, StatusCode};

use crate::error::{LessorError, Result};

/// Pass a successful response through, or map its status onto the error
/// taxonomy with the response body attached for diagnostics.
pub(crate) async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{status} from {url}: {}", body.trim());
    Err(classify_status(status, detail))
}

/// 5xx and 429 are retryable, 404 is a lookup miss, any other 4xx means the
/// request itself was wrong.
pub(crate) fn classify_status(status: StatusCode, detail: String) -> LessorError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        LessorError::Transient(detail)
    } else if status == StatusCode::NOT_FOUND {
        LessorError::NotFound(detail)
    } else {
        LessorError::Validation(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_the_taxonomy() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, String::new()),
            LessorError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()),
            LessorError::Validation(_)
        ));
    }
}
