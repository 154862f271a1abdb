use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lanferry::utils;
use std::io::Write;
use tempfile::NamedTempFile;

fn bench_file_hashing(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sizes = [1024usize, 1024 * 64, 1024 * 1024];
    for &size in &sizes {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0x42; size]).unwrap();
        let path = tmp.path().to_path_buf();
        c.bench_function(&format!("sha256_file_{}KB", size / 1024), |b| {
            b.iter(|| {
                let hash = rt.block_on(utils::sha256_file(&path)).unwrap();
                black_box(hash);
            })
        });
    }
}

criterion_group!(benches, bench_file_hashing);
criterion_main!(benches);
