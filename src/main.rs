mod app_state;
mod auth;
mod config;
mod db;
mod error;
mod group_server;
mod groups;
mod models;
mod notify;
mod status;
mod tasks;
mod ws;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix::Actor;
use actix_cors::Cors;
use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http,
    middleware::Logger,
    web, App, Error, HttpMessage, HttpResponse, HttpServer,
};
use env_logger::Env;
use futures::future::{ok, Ready};
use log::info;

use crate::app_state::AppState;
use crate::auth::{login, signup, validate_jwt};
use crate::groups::{
    create_group, delete_group, group_detail, invite_member, list_groups, list_invitations,
    respond_invitation,
};
use crate::notify::Notifier;
use crate::tasks::{assign_task, complete_task, create_subtask, task_detail, update_subtask_status};
use crate::ws::ws_index;

#[derive(Debug)]
pub struct Authentication {
    jwt_secret: String,
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware {
            service,
            jwt_secret: self.jwt_secret.clone(),
        })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    jwt_secret: String,
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    // Decodes "Bearer <token>" when present and stores the user id in the
    // request extensions; handlers decide whether identity is required.
    fn call(&self, req: ServiceRequest) -> Self::Future {
        if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
            if let Ok(auth_str) = auth_header.to_str() {
                if let Some(token) = auth_str.strip_prefix("Bearer ") {
                    match validate_jwt(token.trim(), &self.jwt_secret) {
                        Ok(claims) => {
                            req.extensions_mut().insert(claims.sub);
                        }
                        Err(e) => {
                            let (req_parts, _payload) = req.into_parts();
                            let resp = HttpResponse::Unauthorized()
                                .json(serde_json::json!({
                                    "error": format!("Invalid token: {}", e)
                                }))
                                .map_into_boxed_body();
                            let srv_resp = ServiceResponse::new(req_parts, resp);
                            return Box::pin(async move { Ok(srv_resp) });
                        }
                    }
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = config::Config::from_env();
    let mongodb = Arc::new(db::MongoDB::init(&config.mongo_uri, &config.database_name).await);

    let group_server = group_server::GroupServer::new(mongodb.clone()).start();
    let notifier = Notifier::new(group_server.clone());

    info!("Server running at http://{}", config.bind_addr);
    info!("Allowed CORS origin: {}", config.frontend_origin);

    let bind_addr = config.bind_addr.clone();
    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&config.frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Authentication {
                jwt_secret: config.jwt_secret.clone(),
            })
            .app_data(web::Data::new(AppState {
                group_server: group_server.clone(),
                notifier: notifier.clone(),
                mongodb: mongodb.clone(),
                config: config.clone(),
            }))
            .service(
                web::scope("/auth")
                    .route("/signup", web::post().to(signup))
                    .route("/login", web::post().to(login)),
            )
            .service(
                web::scope("/groups")
                    .route("", web::get().to(list_groups))
                    .route("", web::post().to(create_group))
                    .service(
                        web::scope("/{group_id}")
                            .route("", web::get().to(group_detail))
                            .route("", web::delete().to(delete_group))
                            .route("/invite", web::post().to(invite_member))
                            .route("/tasks", web::post().to(assign_task)),
                    ),
            )
            .service(
                web::scope("/invitations")
                    .route("", web::get().to(list_invitations))
                    .route("/respond", web::post().to(respond_invitation)),
            )
            .service(
                web::scope("/tasks").service(
                    web::scope("/{task_id}")
                        .route("", web::get().to(task_detail))
                        .route("/subtasks", web::post().to(create_subtask))
                        .route("/complete", web::post().to(complete_task)),
                ),
            )
            .service(
                web::scope("/subtasks")
                    .route("/{subtask_id}/status", web::post().to(update_subtask_status)),
            )
            .service(web::resource("/ws").route(web::get().to(ws_index)))
    })
    .bind(bind_addr)?
    .run()
    .await
}
