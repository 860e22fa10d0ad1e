use std::sync::Arc;

use crate::application::service::CompilationService;

#[derive(Clone)]
pub struct HttpState {
    pub service: Arc<CompilationService>,
    pub upload_limit_bytes: u64,
}
