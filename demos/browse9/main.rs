//! Browse a loopback volume: build a small host tree, mount it, list
//! the root in collation order, then read a file back through the
//! whole stack.
//!
//!     cargo run --example browse9 -- --tag "Demo_3"

use std::sync::{Arc, Mutex};

use clap::Parser;

use ninebridge::loopback::HostFs;
use ninebridge::volume::{Fork, SeekMode, Volume};

#[derive(Parser)]
struct Args {
    /// Mount tag (volume name, optional _hint suffix).
    #[arg(long, default_value = "Demo_3")]
    tag: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut fs = HostFs::new();
    fs.put_file("Read Me", b"hello from the host side\n");
    fs.put_file("App", b"\0\0\0\0");
    fs.put_file("App.idump", b"APPLdemo\n");
    fs.put_file(
        "App.rdump",
        b"data 'STR ' (0, \"greeting\") {\n\t$\"4869\"\n};\n",
    );
    fs.mkdir_p("Documents");
    fs.put_file("Documents/notes.txt", b"deep file");

    let tree = Arc::new(Mutex::new(fs));
    let mut vol = Volume::mount_loopback(tree, &args.tag)
        .await
        .expect("mount failed");

    println!("volume \"{}\" mounted", vol.name);

    println!("root directory, sorted:");
    for index in 1.. {
        match vol.read_dir_sorted(2, index, true).await {
            Ok((cnid, name)) => println!("  {:3}  {:08x}  {}", index, cnid, name),
            Err(_) => break,
        }
    }

    let refnum = vol
        .open(2, b"Read Me", Fork::Data, false)
        .await
        .expect("open failed");
    let mut buf = vec![0u8; 64];
    let outcome = vol
        .read(refnum, SeekMode::FromStart, 0, &mut buf)
        .await
        .expect("read failed");
    println!(
        "Read Me: {:?}",
        String::from_utf8_lossy(&buf[..outcome.actual as usize])
    );
    vol.close(refnum).await.expect("close failed");
}
