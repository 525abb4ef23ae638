// Lists installed applications.

use tmqdevice::Device;

#[tokio::main]
async fn main() {
    env_logger::init();
    let mut udid = None;
    let mut app_type = Some("User".to_string());

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--udid" | "-u" => {
                udid = args.get(i + 1).cloned();
                i += 2;
            }
            "--system" => {
                app_type = Some("System".to_string());
                i += 1;
            }
            "--all" => {
                app_type = None;
                i += 1;
            }
            "-h" | "--help" => {
                println!("tmq_apps - list installed applications");
                println!("Usage:");
                println!("  tmq_apps [--udid <udid>] [--system | --all]");
                return;
            }
            _ => i += 1,
        }
    }

    if let Err(e) = run(udid, app_type).await {
        eprintln!("tmq_apps: {e}");
        std::process::exit(1);
    }
}

async fn run(
    udid: Option<String>,
    app_type: Option<String>,
) -> Result<(), tmqdevice::DeviceError> {
    let device = Device::new(udid.as_deref()).await?;
    let mut installation = device.installation().await?;
    let apps = installation
        .browse(
            app_type.as_deref(),
            Some(&[
                "CFBundleIdentifier",
                "CFBundleDisplayName",
                "CFBundleShortVersionString",
            ]),
        )
        .await?;
    for app in apps {
        let id = app
            .get("CFBundleIdentifier")
            .and_then(|x| x.as_string())
            .unwrap_or("?");
        let name = app
            .get("CFBundleDisplayName")
            .and_then(|x| x.as_string())
            .unwrap_or("");
        let version = app
            .get("CFBundleShortVersionString")
            .and_then(|x| x.as_string())
            .unwrap_or("");
        println!("{id}\t{name}\t{version}");
    }
    Ok(())
}
