use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use shmring::{Backoff, RingBuffer, RingConfig, Word};

use tempfile::tempdir;

const CAPACITY_WORDS: usize = 1024;

fn main() -> Result<(), Box<dyn Error>> {
    println!("Starting shmring multi-process run...");
    let root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .ok_or("harness must live inside the workspace")?
        .to_path_buf();
    let bin_dir = build_binaries(&root)?;
    let temp_dir = tempdir()?;
    let data_dir = temp_dir.path().to_string_lossy().into_owned();

    single_writer_until_end_of_stream(&bin_dir, temp_dir.path(), &data_dir)?;
    two_writers_counted(&bin_dir, temp_dir.path(), &data_dir)?;
    harness_owned_ring(&bin_dir, temp_dir.path(), &data_dir)?;

    println!("All scenarios passed.");
    Ok(())
}

fn build_binaries(root: &Path) -> Result<PathBuf, Box<dyn Error>> {
    let status = Command::new(env::var("CARGO").unwrap_or_else(|_| "cargo".into()))
        .arg("build")
        .arg("--manifest-path")
        .arg(root.join("Cargo.toml"))
        .args(["-p", "shmring-reader", "-p", "shmring-writer"])
        .status()?;
    if !status.success() {
        return Err(format!("building the binaries failed: {}", status).into());
    }
    let target = env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join("target"));
    Ok(target.join("debug"))
}

fn ring_section(data_dir: &str, name: &str) -> String {
    format!(
        "[ring]\ndata_dir = {:?}\nname = {:?}\ncapacity_words = {}\n",
        data_dir, name, CAPACITY_WORDS
    )
}

fn write_config(dir: &Path, file: &str, body: String) -> Result<PathBuf, Box<dyn Error>> {
    let path = dir.join(file);
    fs::write(&path, body)?;
    Ok(path)
}

fn spawn(bin_dir: &Path, bin: &str, config: &Path, args: &[&str]) -> Result<Child, Box<dyn Error>> {
    let child = Command::new(bin_dir.join(bin))
        .arg("-c")
        .arg(config)
        .args(args)
        .spawn()?;
    Ok(child)
}

fn expect_success(mut child: Child, what: &str) -> Result<(), Box<dyn Error>> {
    let status = child.wait()?;
    if !status.success() {
        return Err(format!("{} exited with {}", what, status).into());
    }
    println!("[{}] finished", what);
    Ok(())
}

/// The reader owns the ring and stops once the only writer has left and
/// everything it wrote was consumed.
fn single_writer_until_end_of_stream(
    bin_dir: &Path,
    dir: &Path,
    data_dir: &str,
) -> Result<(), Box<dyn Error>> {
    println!("[Scenario] single writer, end of stream");
    let name = "single";
    let reader_cfg = write_config(
        dir,
        "single-reader.toml",
        format!("verify_order = true\n\n{}", ring_section(data_dir, name)),
    )?;
    let writer_cfg = write_config(
        dir,
        "single-writer.toml",
        format!("messages = 200000\npayload_words = 13\n\n{}", ring_section(data_dir, name)),
    )?;

    let reader = spawn(bin_dir, "shmring-reader", &reader_cfg, &["--create"])?;
    let writer = spawn(bin_dir, "shmring-writer", &writer_cfg, &[])?;
    expect_success(writer, "writer")?;
    expect_success(reader, "reader")?;
    if Path::new(data_dir).join(name).exists() {
        return Err("owner exited but the link file is still there".into());
    }
    Ok(())
}

fn two_writers_counted(bin_dir: &Path, dir: &Path, data_dir: &str) -> Result<(), Box<dyn Error>> {
    println!("[Scenario] two writers, counted");
    let name = "pair";
    let reader_cfg = write_config(
        dir,
        "pair-reader.toml",
        format!("verify_order = false\n\n{}", ring_section(data_dir, name)),
    )?;
    let writer_cfg = write_config(
        dir,
        "pair-writer.toml",
        format!("messages = 50000\npayload_words = 5\n\n{}", ring_section(data_dir, name)),
    )?;

    let reader = spawn(bin_dir, "shmring-reader", &reader_cfg, &["--create", "--expect", "100000"])?;
    let first = spawn(bin_dir, "shmring-writer", &writer_cfg, &[])?;
    let second = spawn(bin_dir, "shmring-writer", &writer_cfg, &[])?;
    expect_success(first, "first writer")?;
    expect_success(second, "second writer")?;
    expect_success(reader, "reader")
}

/// This process owns the ring and checks every record a writer process sent.
fn harness_owned_ring(bin_dir: &Path, dir: &Path, data_dir: &str) -> Result<(), Box<dyn Error>> {
    println!("[Scenario] harness-owned ring");
    const MESSAGES: Word = 5_000;
    let name = "owned";
    let ring = RingBuffer::create(&RingConfig::new(data_dir, name, CAPACITY_WORDS))?;
    let writer_cfg = write_config(
        dir,
        "owned-writer.toml",
        format!("messages = {}\npayload_words = 3\n\n{}", MESSAGES, ring_section(data_dir, name)),
    )?;
    let mut writer = spawn(bin_dir, "shmring-writer", &writer_cfg, &[])?;

    let mut backoff = Backoff::default();
    let mut next: Word = 0;
    while next < MESSAGES {
        match ring.dequeue()? {
            Some(record) => {
                if record != vec![next, 3, 0] {
                    writer.kill()?;
                    return Err(format!("record {} arrived as {:?}", next, record).into());
                }
                next += 1;
                backoff.reset();
            }
            None => {
                if let Some(status) = writer.try_wait()? {
                    if ring.count()? == 0 {
                        return Err(format!("writer exited with {} after {} records", status, next).into());
                    }
                }
                backoff.snooze();
            }
        }
    }
    expect_success(writer, "writer")?;

    let info = ring.info()?;
    println!("[Harness] {}", info);
    if info.enqueued_total != MESSAGES as u64 || info.corrupt_records != 0 || info.producers != 0 {
        return Err(format!("unexpected counters: {}", info).into());
    }
    ring.destroy()?;
    Ok(())
}
