//! Prints the Declaration CustomResourceDefinition as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/declaration.yaml`

use crds::Declaration;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Declaration::crd())?);
    Ok(())
}
