//! Mesh sensor node firmware. Builds for ESP32 targets with `--features esp32`;
//! without it the same lifecycle runs against a simulated stack on the host.

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
