//! voucherd - expiry sweeper daemon for the voucher redemption store

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    voucher_redemption::daemon::run().await
}
