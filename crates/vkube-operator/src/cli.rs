//! Command line configuration

use std::path::PathBuf;

use clap::Parser;

use vkube_common::kube_utils::is_dns_label;
use vkube_common::{Error, Result};
use vkube_syncer::{EnabledControllers, PodSecurityStandard, SyncOptions, WebhookOptions};

/// vkube - virtual cluster resource syncer
#[derive(Parser, Debug, Clone)]
#[command(name = "vkube", version, about, long_about = None)]
pub struct Cli {
    /// Virtual cluster instance name
    #[arg(long, env = "VKUBE_NAME")]
    pub name: String,

    /// Physical namespace virtual objects are synced into
    #[arg(long, env = "VKUBE_TARGET_NAMESPACE")]
    pub target_namespace: String,

    /// Namespace the syncer runs in
    #[arg(long, env = "POD_NAMESPACE")]
    pub current_namespace: String,

    /// Physical Service fronting the virtual API server; defaults to the instance name
    #[arg(long, env = "VKUBE_SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Syncers to enable (`+key`) or disable (`-key`) on top of the defaults
    #[arg(long, env = "VKUBE_SYNC", value_delimiter = ',', allow_hyphen_values = true)]
    pub sync: Vec<String>,

    /// Pod security standard to enforce: privileged, baseline, restricted or empty
    #[arg(long, env = "VKUBE_ENFORCE_POD_SECURITY_STANDARD", default_value = "")]
    pub enforce_pod_security_standard: String,

    /// Label selector for physical nodes mirrored by the real node syncer
    #[arg(long, env = "VKUBE_NODE_SELECTOR")]
    pub node_selector: Option<String>,

    /// Concurrent reconciles per syncer
    #[arg(long, env = "VKUBE_MAX_CONCURRENT_RECONCILES", default_value_t = 10)]
    pub max_concurrent_reconciles: usize,

    /// Kubeconfig of the virtual API server
    #[arg(long, env = "VKUBE_VIRTUAL_KUBECONFIG")]
    pub virtual_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the physical cluster; in-cluster config when unset
    #[arg(long, env = "VKUBE_PHYSICAL_KUBECONFIG")]
    pub physical_kubeconfig: Option<PathBuf>,

    /// Admission webhook HTTPS port
    #[arg(long, env = "VKUBE_WEBHOOK_PORT", default_value_t = 9443)]
    pub webhook_port: u16,

    /// Admission webhook certificate (PEM)
    #[arg(long, env = "VKUBE_WEBHOOK_CERT", default_value = "/var/run/vkube/webhook/tls.crt")]
    pub webhook_cert: PathBuf,

    /// Admission webhook key (PEM)
    #[arg(long, env = "VKUBE_WEBHOOK_KEY", default_value = "/var/run/vkube/webhook/tls.key")]
    pub webhook_key: PathBuf,

    /// CA bundle advertised to the virtual API server
    #[arg(long, env = "VKUBE_WEBHOOK_CA")]
    pub webhook_ca: Option<PathBuf>,

    /// Base URL the virtual API server uses to reach the webhook
    #[arg(long, env = "VKUBE_WEBHOOK_URL")]
    pub webhook_url: Option<String>,
}

impl Cli {
    /// Validated sync options
    pub fn sync_options(&self) -> Result<SyncOptions> {
        for (field, value) in [
            ("name", &self.name),
            ("target-namespace", &self.target_namespace),
            ("current-namespace", &self.current_namespace),
        ] {
            if !is_dns_label(value) {
                return Err(Error::validation_for_field(
                    "configuration",
                    field,
                    format!("{value:?} is not a valid DNS label"),
                ));
            }
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::validation_for_field(
                "configuration",
                "max-concurrent-reconciles",
                "must be at least 1",
            ));
        }

        let mut options = SyncOptions::new(&self.name, &self.target_namespace, &self.current_namespace);
        if let Some(service) = &self.service_name {
            options.service_name = service.clone();
        }
        options.pod_security_standard =
            PodSecurityStandard::parse_optional(&self.enforce_pod_security_standard)?;
        options.node_selector = self.node_selector.clone().filter(|s| !s.trim().is_empty());
        options.max_concurrent_reconciles = self.max_concurrent_reconciles;
        options.webhook = WebhookOptions {
            port: self.webhook_port,
            cert_path: self.webhook_cert.clone(),
            key_path: self.webhook_key.clone(),
            ca_path: self.webhook_ca.clone(),
            url: self.webhook_url.clone(),
        };
        Ok(options)
    }

    /// Enabled syncers after applying `--sync`
    pub fn enabled_controllers(&self) -> EnabledControllers {
        EnabledControllers::from_flags(&self.sync)
    }
}
