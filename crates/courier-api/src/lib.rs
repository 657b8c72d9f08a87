pub mod messages;
pub mod middleware;

use std::sync::Arc;

use courier_db::Database;
use courier_gateway::Gateway;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub gateway: Gateway,
    pub jwt_secret: String,
}
