//! Build script for netwarden
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by the CLI `--version` output.

fn main() {
    // Re-run build if the packaged nft path override changes
    println!("cargo:rerun-if-env-changed=NETWARDEN_SYSTEM_NFT_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
