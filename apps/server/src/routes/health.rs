use actix_web::{HttpResponse, Responder, get};

macros_utils::routes! {
    route health,
}

const VERSION: &str = concat!("sitewatch-server ", env!("CARGO_PKG_VERSION"));

/// Liveness of the HTTP server itself; storage and probing are not checked
#[get("/")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().content_type("text/plain").body(VERSION)
}

#[cfg(test)]
mod tests {
    use actix_web::{App, test};

    #[actix_web::test]
    async fn test_health_reports_version() {
        let app = test::init_service(App::new().configure(super::routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert!(resp.status().is_success());

        let body = test::read_body(resp).await;
        assert!(body.starts_with(b"sitewatch-server "));
    }
}
