//! Default security context admission webhook
//!
//! Served only when the `restricted` standard is enforced. Every container
//! created without a security context in the virtual cluster gets a hardened
//! default; containers that declare one are left alone.

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Capabilities, Pod, SeccompProfile, SecurityContext};
use k8s_openapi::ByteString;
use kube::api::{Api, DynamicObject, ObjectMeta, Patch, PatchParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use vkube_common::{Error, Result, FIELD_MANAGER};
use vkube_syncer::{PodSecurityStandard, RegisterContext, WebhookOptions};

/// Runnable name
pub const NAME: &str = "default-security-context";

/// Admission path for pods
pub const MUTATE_PATH: &str = "/mutate-v1-pod";

/// Unprivileged uid injected into defaulted containers
pub const DEFAULT_RUN_AS_USER: i64 = 65534;

/// Security context given to containers that declare none
pub fn default_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: Some(vec!["NET_BIND_SERVICE".to_string()]),
        }),
        run_as_non_root: Some(true),
        run_as_user: Some(DEFAULT_RUN_AS_USER),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

/// JSON patch adding the default security context to every container lacking one
pub fn build_patch_operations(pod: &Pod) -> Vec<PatchOperation> {
    let Some(spec) = &pod.spec else {
        return Vec::new();
    };
    let value = serde_json::to_value(default_security_context()).unwrap_or_default();

    spec.containers
        .iter()
        .enumerate()
        .filter(|(_, c)| c.security_context.is_none())
        .map(|(i, _)| {
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "containers", &i.to_string(), "securityContext"]),
                value: value.clone(),
            })
        })
        .collect()
}

/// Admission decision for one pod request; always allows
pub fn mutate(request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let Some(pod) = &request.object else {
        return response;
    };

    let ops = build_patch_operations(pod);
    if ops.is_empty() {
        return response;
    }

    let pod_name = pod
        .metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default();
    info!(
        uid = %request.uid,
        namespace = ?request.namespace,
        pod = %pod_name,
        containers = ops.len(),
        "adding default security context"
    );
    match response.clone().with_patch(json_patch::Patch(ops)) {
        Ok(patched) => patched,
        Err(e) => {
            error!(uid = %request.uid, error = %e, "failed to serialize patch");
            response
        }
    }
}

async fn mutate_handler(Json(review): Json<AdmissionReview<Pod>>) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(mutate(&request).into_review())
}

/// Routes served by the webhook
pub fn router() -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// URL the virtual API server calls
pub fn webhook_url(options: &WebhookOptions, service_name: &str, namespace: &str) -> String {
    match &options.url {
        Some(url) => format!("{}{MUTATE_PATH}", url.trim_end_matches('/')),
        None => format!("https://{service_name}.{namespace}.svc:{}{MUTATE_PATH}", options.port),
    }
}

/// Webhook configuration registering the pod defaulter in the virtual cluster
pub fn webhook_configuration(url: String, ca_bundle: Option<Vec<u8>>) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: "default-security-context.vkube.dev".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Ignore".to_string()),
            reinvocation_policy: Some("Never".to_string()),
            client_config: WebhookClientConfig {
                url: Some(url),
                ca_bundle: ca_bundle.map(ByteString),
                service: None,
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                operations: Some(vec!["CREATE".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            ..Default::default()
        }]),
    }
}

async fn apply_configuration(client: &Client, config: &MutatingWebhookConfiguration) -> Result<()> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    api.patch(NAME, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(config))
        .await?;
    debug!("mutating webhook configuration applied");
    Ok(())
}

async fn serve(
    client: Client,
    options: WebhookOptions,
    url: String,
    cancel: CancellationToken,
) -> Result<()> {
    let ca_bundle = match &options.ca_path {
        Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
            Error::internal_with_context(NAME, format!("read CA bundle {}: {e}", path.display()))
        })?),
        None => None,
    };
    let tls = RustlsConfig::from_pem_file(&options.cert_path, &options.key_path)
        .await
        .map_err(|e| Error::internal_with_context(NAME, format!("TLS config error: {e}")))?;

    apply_configuration(&client, &webhook_configuration(url, ca_bundle)).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], options.port));
    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(None);
    });

    info!(%addr, "starting default security context webhook");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(router().into_make_service())
        .await
        .map_err(|e| Error::internal_with_context(NAME, format!("server error: {e}")))
}

/// Add the webhook server to the virtual manager when `restricted` is enforced
pub fn register(ctx: &RegisterContext) -> Result<()> {
    if ctx.options.pod_security_standard != Some(PodSecurityStandard::Restricted) {
        return Ok(());
    }
    let url = webhook_url(
        &ctx.options.webhook,
        &ctx.options.service_name,
        &ctx.options.current_namespace,
    );
    let runnable = serve(
        ctx.virtual_manager.client(),
        ctx.options.webhook.clone(),
        url,
        ctx.cancel.clone(),
    );
    ctx.virtual_manager.add_runnable(NAME, Box::pin(runnable))?;
    Ok(())
}
