use gcp_infra_extension::crd::{Cluster, Infrastructure};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Infrastructure::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Cluster::crd())?);
    Ok(())
}
