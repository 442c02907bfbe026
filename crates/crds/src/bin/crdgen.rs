//! Prints the CRDs owned by the kubemark provider as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/kubemarkmachines.yaml`

use crds::KubemarkMachine;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&KubemarkMachine::crd())?);
    Ok(())
}
