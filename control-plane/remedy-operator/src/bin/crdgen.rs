use kube::core::CustomResourceExt;
use remedy_operator::crd::remediation_policy::RemediationPolicy;

fn main() {
    let crd = RemediationPolicy::crd();
    let yaml = serde_yaml::to_string(&crd).expect("serialize CRD to YAML");
    println!("{}", yaml);
}
