// Lists attached devices, or watches attach/detach events.

use tmqdevice::usbmux::{MuxEvent, UsbmuxAddr};

#[tokio::main]
async fn main() {
    env_logger::init();
    let watch = std::env::args().any(|a| a == "--watch");
    if std::env::args().any(|a| a == "-h" || a == "--help") {
        println!("tmq_devices - list devices known to the mux daemon");
        println!("Usage:");
        println!("  tmq_devices [--watch]");
        println!("\nSet TMQ_USBMUX to override the daemon endpoint.");
        return;
    }

    let addr = UsbmuxAddr::from_env();
    if watch {
        let conn = match addr.connect(1).await {
            Ok(c) => c,
            Err(e) => return fail(e),
        };
        let mut watcher = match conn.listen().await {
            Ok(w) => w,
            Err(e) => return fail(e),
        };
        loop {
            match watcher.next_event().await {
                Ok(MuxEvent::Attached(d)) => {
                    println!("attached {} ({:?}, id {})", d.udid, d.connection, d.device_id)
                }
                Ok(MuxEvent::Detached(id)) => println!("detached id {id}"),
                Ok(MuxEvent::Paired(id)) => println!("paired id {id}"),
                Err(e) => return fail(e),
            }
        }
    }

    let mut conn = match addr.connect(1).await {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    match conn.list_devices().await {
        Ok(devices) => {
            for d in devices {
                println!("{}\t{:?}\tid {}", d.udid, d.connection, d.device_id);
            }
        }
        Err(e) => fail(e),
    }
}

fn fail(e: tmqdevice::DeviceError) {
    eprintln!("tmq_devices: {e}");
    std::process::exit(1);
}
