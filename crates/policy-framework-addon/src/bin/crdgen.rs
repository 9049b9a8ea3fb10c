use kube::core::CustomResourceExt;
use policy_framework_addon::crds::{configuration_policy::ConfigurationPolicy, policy::Policy};

fn main() {
    let crds = vec![Policy::crd(), ConfigurationPolicy::crd()];
    for (i, crd) in crds.into_iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        println!("{}", serde_yaml::to_string(&crd).expect("serialize crd"));
    }
}
