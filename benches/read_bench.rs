use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sharedcache::{CacheOptions, SharedReader, Transport};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

struct MemTransport {
    data: Arc<Vec<u8>>,
    pos:  u64,
}

impl Transport for MemTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = (self.pos.min(self.data.len() as u64)) as usize;
        let n = buf.len().min(self.data.len() - pos);
        buf[..n].copy_from_slice(&self.data[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if let SeekFrom::Start(p) = pos {
            self.pos = p;
        }
        Ok(self.pos)
    }
    fn size(&mut self) -> io::Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }
}

fn bench_cached_reads(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let data = Arc::new(vec![0xA7u8; 16 * 1024 * 1024]);
    let mut opts = CacheOptions::new(dir.path());
    opts.block_shift = 15;

    // Warm the cache once, then measure the hit path.
    let t = Box::new(MemTransport { data: Arc::clone(&data), pos: 0 });
    let mut reader = SharedReader::open_with(t, "bench://hot", opts).unwrap();
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match reader.read(&mut buf).unwrap() {
            0 => break,
            _ => {}
        }
    }

    c.bench_function("cached_read_16mb_hit", |b| {
        b.iter(|| {
            reader.seek(SeekFrom::Start(0)).unwrap();
            let mut total = 0usize;
            loop {
                match reader.read(black_box(&mut buf)).unwrap() {
                    0 => break,
                    n => total += n,
                }
            }
            black_box(total)
        })
    });
}

criterion_group!(benches, bench_cached_reads);
criterion_main!(benches);
