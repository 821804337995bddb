use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::problems::ProblemStore;
use crate::routes::{configure, json_error_handler};
use crate::session::SessionManager;

pub const API_PREFIX: &str = "/api/v1";

pub fn build_server(
    server_config: ServerConfig,
    manager: Arc<SessionManager>,
    problems: ProblemStore,
) -> std::io::Result<Server> {
    let manager = web::Data::from(manager);
    let problems = web::Data::new(problems);

    let address = server_config
        .bind_address
        .unwrap_or("127.0.0.1".to_string());
    let port = server_config.bind_port.unwrap_or(12345);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(manager.clone())
            .app_data(problems.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(web::scope(API_PREFIX).configure(configure))
    })
    .bind((address.as_str(), port))?
    .run();

    log::info!("Listening on {address}:{port}");
    Ok(server)
}
