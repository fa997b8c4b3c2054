pub mod agent;
pub mod chat;
pub mod config;
pub mod connector;
pub mod database;
pub mod events;
pub mod fallback;
pub mod followup;
pub mod http_client;
pub mod orchestrator;
pub mod personality;
pub mod pomodoro;
pub mod prefs;
pub mod prompts;
pub mod rooms;
pub mod runtime;
pub mod server;
pub mod speech;
