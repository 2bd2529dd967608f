pub mod broadcast;
pub mod directory;
pub mod dispatcher;
pub mod materializer;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod target;
