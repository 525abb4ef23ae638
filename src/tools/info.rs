// Prints device properties, whole or by key/domain.

use tmqdevice::Device;

#[tokio::main]
async fn main() {
    env_logger::init();
    let mut udid = None;
    let mut domain = None;
    let mut key = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--udid" | "-u" => {
                udid = args.get(i + 1).cloned();
                i += 2;
            }
            "--domain" | "-q" => {
                domain = args.get(i + 1).cloned();
                i += 2;
            }
            "--key" | "-k" => {
                key = args.get(i + 1).cloned();
                i += 2;
            }
            "-h" | "--help" => {
                println!("tmq_info - read device properties through lockdown");
                println!("Usage:");
                println!("  tmq_info [--udid <udid>] [--domain <domain>] [--key <key>]");
                println!("\nSet TMQ_DEVICE_UDID to preselect a device.");
                return;
            }
            _ => i += 1,
        }
    }

    if let Err(e) = run(udid, domain, key).await {
        eprintln!("tmq_info: {e}");
        std::process::exit(1);
    }
}

async fn run(
    udid: Option<String>,
    domain: Option<String>,
    key: Option<String>,
) -> Result<(), tmqdevice::DeviceError> {
    let device = Device::new(udid.as_deref()).await?;
    let mut lockdown = device.lockdown_session().await?;
    match key {
        Some(key) => {
            let value = lockdown.get_value(Some(&key), domain.as_deref()).await?;
            println!("{value:?}");
        }
        None => {
            let values = lockdown.get_all_values(domain.as_deref()).await?;
            for (k, v) in values {
                println!("{k}: {v:?}");
            }
        }
    }
    lockdown.stop_session().await.ok();
    Ok(())
}
