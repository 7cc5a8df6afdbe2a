pub mod config;
pub mod speech;

pub use config::*;
pub use speech::*;

use crate::error::{AppError, AppResult};
use actix_web::{HttpRequest, HttpResponse};

/// Fallback for unknown routes, answered in the JSON error shape.
pub async fn not_found(req: HttpRequest) -> AppResult<HttpResponse> {
    Err(AppError::NotFound(format!("{} {}", req.method(), req.path())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn test_unknown_route_is_json_404() {
        let app = test::init_service(App::new().default_service(web::route().to(not_found))).await;

        let req = test::TestRequest::get().uri("/api/v1/nope").to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status(), 404);

        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "not_found");
        assert_eq!(body["error"]["message"], "GET /api/v1/nope");
    }
}
