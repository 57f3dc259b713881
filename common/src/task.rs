use serde::{Deserialize, Serialize};

use crate::builder::UnitDescriptor;
use crate::job::JobId;
use crate::worker::WorkerId;

pub type DeploymentId = String;

/// Conjunto de unidades de un job que corre un worker en un solo bush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub descriptors: Vec<UnitDescriptor>,
}

impl Deployment {
    /// Unidades tick: las que el worker espera antes de reportar.
    pub fn tick_count(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_tick()).count()
    }
}
