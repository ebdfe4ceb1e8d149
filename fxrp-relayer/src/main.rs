//! FXRP Relayer
//!
//! Entry point for the FXRP bridge relayer service.

use fxrp_relayer::main_entry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    main_entry::run_server().await
}
