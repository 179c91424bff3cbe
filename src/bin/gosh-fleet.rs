// [[file:../../fleet.note::8f3c2a90][8f3c2a90]]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gosh_fleet::cli::fleet_enter_main().await
}
// 8f3c2a90 ends here
