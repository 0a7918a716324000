pub mod config;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod session;
pub mod signaling;
pub mod store;
pub mod ws;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}};

pub use config::Config;
use hub::Hub;
use registry::Registry;
use signaling::CallRelay;
use store::MessageLog;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub hub: Arc<Hub>,
    pub relay: Arc<CallRelay>,
    pub log: MessageLog,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let log = MessageLog::connect(&config.database_url).await?;
        Ok(Self::with_log(config, log))
    }

    pub fn with_log(config: Config, log: MessageLog) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.outbound_queue)),
            registry: Arc::new(Registry::new()),
            relay: Arc::new(CallRelay::new()),
            config: Arc::new(config),
            log,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(store::StoreError);
