use chrono::Utc;

fn main() {
    let stamp = Utc::now().format("%Y%m%d").to_string();
    println!("cargo:rustc-env=CAMLINK_BUILD_DATE={stamp}");
    println!("cargo:rerun-if-changed=build.rs");
}
