use crate::config::Config;
use crate::db::MongoDB;
use crate::group_server::GroupServer;
use crate::notify::Notifier;
use actix::Addr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub group_server: Addr<GroupServer>,
    pub notifier: Notifier,
    pub mongodb: Arc<MongoDB>,
    pub config: Config,
}
