use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const CHUNK: usize = 1024 * 1024;

/// Write `size` bytes where each 16-byte row starts with its own offset, so any
/// position in a hex dump can be checked by eye.
fn generate_patterned(path: &Path, size: u64) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(CHUNK, file);
    let mut chunk = vec![0u8; CHUNK];
    let mut written = 0u64;

    while written < size {
        let len = (size - written).min(CHUNK as u64) as usize;
        for (i, byte) in chunk[..len].iter_mut().enumerate() {
            let pos = written + i as u64;
            *byte = match pos % 16 {
                col @ 0..=7 => (pos >> (8 * (7 - col))) as u8,
                col => b'a' + col as u8,
            };
        }
        writer.write_all(&chunk[..len])?;
        written += len as u64;

        // Flush periodically to avoid memory buildup
        if written % (64 * CHUNK as u64) == 0 {
            writer.flush()?;
            print!("\rWritten {} MB...", written / CHUNK as u64);
            std::io::stdout().flush()?;
        }
    }

    writer.flush()?;
    println!("\r{}: {} bytes", path.display(), size);
    Ok(())
}

fn main() {
    println!("Binary Test Data Generator");
    println!("==========================\n");

    let dir = env::args().nth(1).unwrap_or_else(|| "test-data".to_string());
    let dir = Path::new(&dir);
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Error creating {}: {}", dir.display(), e);
        return;
    }

    let files = [
        ("small.bin", 1u64 << 20),
        ("medium.bin", 100 << 20),
        // This will take a while
        ("large.bin", 2 << 30),
    ];

    for (name, size) in files {
        let path = dir.join(name);
        if let Err(e) = generate_patterned(&path, size) {
            eprintln!("Error generating {}: {}", path.display(), e);
        }
    }

    println!("\nAll test files generated in {}", dir.display());
}
