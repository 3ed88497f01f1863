pub mod conversations;
pub mod messages;
pub mod middleware;
pub mod shape;

use std::sync::Arc;

use aperture_db::Database;
use aperture_gateway::router::GroupRouter;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub router: GroupRouter,
}
