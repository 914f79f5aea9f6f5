pub mod agents;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod db;
pub mod legacy;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::agents::{Agent, AgentKind};
    pub use crate::config::Settings;
    pub use crate::credentials::{CredentialResolver, SecretStore};
    pub use crate::models::{ModelProfile, NewProfile, ProfileUpdate, ResolvedConfig};
    pub use crate::session::Session;
    pub use crate::{catalog, db, legacy, llm, server, telemetry};
}
