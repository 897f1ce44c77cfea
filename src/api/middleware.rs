use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::{ErrorBody, ErrorDetail};

/// The verified caller identity, established by the outer boundary and
/// forwarded in a trusted header. Authentication itself happens outside
/// this process.
#[derive(Clone, Debug)]
pub struct Principal(pub String);

pub const PRINCIPAL_HEADER: &str = "x-agent-principal";

/// Attach the principal to the request and reject mutating operations that
/// arrive without one.
pub async fn principal_middleware(mut req: Request<Body>, next: Next) -> Response {
    let principal = req
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let audit_principal = match principal {
        Some(principal) => {
            req.extensions_mut().insert(Principal(principal.clone()));
            principal
        }
        None if method == Method::GET => "-".to_string(),
        None => {
            log::warn!("AUDIT DENIED method={method} path={path} reason=missing_principal");
            let body = ErrorBody {
                error: ErrorDetail {
                    kind: "unauthenticated".to_string(),
                    message: "mutating operations require a verified principal".to_string(),
                    retryable: false,
                },
            };
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }
    };

    let response = next.run(req).await;

    if method != Method::GET {
        log::info!(
            "AUDIT principal={audit_principal} method={method} path={path} status={}",
            response.status().as_u16()
        );
    }

    response
}
