// Launches an XCUITest runner and keeps it alive until ctrl-c.

use std::sync::Arc;

use tmqdevice::xctest::XcTestDriver;
use tmqdevice::Device;
use tokio::sync::Notify;

#[tokio::main]
async fn main() {
    env_logger::init();
    let mut udid = None;
    let mut bundle_id = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--udid" | "-u" => {
                udid = args.get(i + 1).cloned();
                i += 2;
            }
            "-h" | "--help" => {
                println!("tmq_xctest - run a UI test bundle until interrupted");
                println!("Usage:");
                println!("  tmq_xctest [--udid <udid>] <runner-bundle-id>");
                println!("\nExample:");
                println!("  tmq_xctest com.facebook.WebDriverAgentRunner.xctrunner");
                return;
            }
            other => {
                bundle_id = Some(other.to_string());
                i += 1;
            }
        }
    }

    let bundle_id = match bundle_id {
        Some(b) => b,
        None => {
            eprintln!("tmq_xctest: pass the runner bundle id");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(udid, &bundle_id).await {
        eprintln!("tmq_xctest: {e}");
        std::process::exit(1);
    }
}

async fn run(udid: Option<String>, bundle_id: &str) -> Result<(), tmqdevice::DeviceError> {
    let device = Device::new(udid.as_deref()).await?;
    let stop = Arc::new(Notify::new());

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.notify_waiters();
            }
        });
    }

    let driver = XcTestDriver::new(&device, bundle_id);
    driver.run(stop).await
}
