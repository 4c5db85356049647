//! Request accounting for the HTTP API surface.
//!
//! WebSocket upgrades are deliberately excluded: a relay connection is a
//! session, tracked by the session counters in [`AppState`], and folding a
//! long-lived upgrade into per-endpoint request durations would make those
//! numbers meaningless.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::info;

/// Records request counts and per-endpoint timings into [`AppState`], and logs
/// one structured line per completed API request.
pub struct MetricsMiddleware;

fn is_relay_upgrade(path: &str) -> bool {
    path.starts_with("/ws/")
}

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let skip = is_relay_upgrade(req.path());
        let started = Instant::now();
        let endpoint = format!("{} {}", req.method(), req.uri().path());

        if !skip {
            if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
                app_state.increment_request_count();
            }
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            if skip {
                return result;
            }

            let duration_ms = started.elapsed().as_millis() as u64;
            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Ok(response) = &result {
                if let Some(app_state) = response.request().app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, duration_ms, is_error);
                    if is_error {
                        app_state.increment_error_count();
                    }
                }

                info!(
                    endpoint = %endpoint,
                    status = response.status().as_u16(),
                    duration_ms = duration_ms,
                    "request completed"
                );
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::health;
    use crate::websocket;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_counts_api_requests_but_not_relay_upgrades() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/health", web::get().to(health::health_check))
                .route("/ws/audio", web::get().to(websocket::relay_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        test::call_service(&app, req).await;

        // Fails the handshake, but must still bypass the HTTP counters.
        let req = test::TestRequest::get().uri("/ws/audio").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 1);
        assert!(snapshot.endpoint_metrics.contains_key("GET /health"));
        assert!(!snapshot.endpoint_metrics.keys().any(|k| k.contains("/ws/")));
    }
}
