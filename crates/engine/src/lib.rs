pub mod dispatcher;
pub mod fetch;
pub mod plugin;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod task_data;
