use documentdb_operator::crd::DocumentDB;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&DocumentDB::crd())?);
    Ok(())
}
