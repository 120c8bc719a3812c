use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use aim_common::crd::{AIMCache, AIMEndpoint, AIMRecipe};

/// Field manager used when applying CRDs
const FIELD_MANAGER: &str = "aim-operator";

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn aim_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: AIMRecipe::crd_name(),
            crd: AIMRecipe::crd(),
        },
        CrdDef {
            name: AIMCache::crd_name(),
            crd: AIMCache::crd(),
        },
        CrdDef {
            name: AIMEndpoint::crd_name(),
            crd: AIMEndpoint::crd(),
        },
    ]
}

/// Render every AIM CRD as a multi-document YAML stream
pub fn render_crds() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for def in aim_crds() {
        let yaml = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        docs.push(yaml);
    }
    Ok(docs.join("---\n"))
}

/// Ensure all AIM CRDs are installed
///
/// CRDs are applied with server-side apply on every startup so the installed
/// schema always matches the operator version.
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in aim_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("All AIM CRDs installed/updated");
    Ok(())
}
