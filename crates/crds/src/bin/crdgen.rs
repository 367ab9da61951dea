//! Print the SpecialResource CRD manifests as a multi-document YAML stream

use crds::{SpecialResource, SpecialResourceModule};
use kube::core::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let manifests = [SpecialResource::crd(), SpecialResourceModule::crd()];
    for crd in manifests {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
