//! Status View service (component G): a thin, mockable read layer over the
//! reconciliation supervisor's shared state.

use mockall::automock;
use serde::Serialize;

use crate::model::BridgeGroupView;
use crate::supervisor::{SupervisorStateRef, WorkerView};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub errors: Vec<String>,
    pub interfaces: Vec<WorkerView>,
    pub crash: Option<String>,
}

#[automock]
#[async_trait::async_trait]
pub trait StatusServiceTrait: Send + Sync {
    async fn stats_raw(&self) -> Vec<BridgeGroupView>;
    async fn stats(&self) -> StatsResponse;
}

pub struct StatusService {
    pub state: SupervisorStateRef,
}

impl StatusService {
    pub fn new(state: SupervisorStateRef) -> Self {
        StatusService { state }
    }
}

#[async_trait::async_trait]
impl StatusServiceTrait for StatusService {
    async fn stats_raw(&self) -> Vec<BridgeGroupView> {
        let state = self.state.lock().await;
        state.desired_views()
    }

    async fn stats(&self) -> StatsResponse {
        let state = self.state.lock().await;
        StatsResponse {
            errors: state.errors(),
            interfaces: state.worker_views(),
            crash: state.crash(),
        }
    }
}
