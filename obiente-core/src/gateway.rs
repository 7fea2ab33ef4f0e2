use serde_json::json;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Optional L3 IP allocator. Absence of a configured gateway is non-fatal
/// everywhere; callers log reservation/release failures and continue.
pub struct GatewayClient {
    http: reqwest::Client,
    base: String,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> OrchestratorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Reserve an address for a VM. The returned address is advisory until
    /// the guest agent confirms it landed.
    pub async fn allocate_ip(
        &self,
        vm_id: &str,
        organization_id: &str,
    ) -> OrchestratorResult<String> {
        let response = self
            .http
            .post(format!("{}/v1/allocations", self.base))
            .json(&json!({
                "vm_id": vm_id,
                "organization_id": organization_id,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| OrchestratorError::Hypervisor(e.to_string()))?;
        let body: serde_json::Value = response.json().await?;
        let ip = body["ip"]
            .as_str()
            .ok_or_else(|| OrchestratorError::Hypervisor("gateway returned no ip".into()))?;
        debug!("Gateway reserved {} for VM {}", ip, vm_id);
        Ok(ip.to_string())
    }

    pub async fn release_ip(&self, vm_id: &str) -> OrchestratorResult<()> {
        self.http
            .delete(format!("{}/v1/allocations/{}", self.base, vm_id))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| OrchestratorError::Hypervisor(e.to_string()))?;
        debug!("Gateway released allocation of VM {}", vm_id);
        Ok(())
    }
}
