// Saves one screenshot in the device's native encoding.

use tmqdevice::Device;

#[tokio::main]
async fn main() {
    env_logger::init();
    let mut udid = None;
    let mut out = "screenshot.png".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--udid" | "-u" => {
                udid = args.get(i + 1).cloned();
                i += 2;
            }
            "-h" | "--help" => {
                println!("tmq_screenshot - capture the device screen");
                println!("Usage:");
                println!("  tmq_screenshot [--udid <udid>] [output-path]");
                return;
            }
            other => {
                out = other.to_string();
                i += 1;
            }
        }
    }

    if let Err(e) = run(udid, &out).await {
        eprintln!("tmq_screenshot: {e}");
        std::process::exit(1);
    }
}

async fn run(udid: Option<String>, out: &str) -> Result<(), tmqdevice::DeviceError> {
    let device = Device::new(udid.as_deref()).await?;
    let mut shooter = device.screenshot_service().await?;
    let data = shooter.take().await?;
    tokio::fs::write(out, &data).await?;
    println!("wrote {} bytes to {out}", data.len());
    Ok(())
}
