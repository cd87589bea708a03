use durable_log::{Log, LogConfig};

#[tokio::test]
async fn scan_after_reopen_reproduces_written_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let payloads: Vec<Vec<u8>> = (0u32..37)
        .map(|i| vec![(i % 251) as u8; 1 + (i as usize * 7) % 200])
        .collect();

    {
        let log = Log::open(LogConfig {
            directory: dir.path().to_path_buf(),
            page_size_bits: 14,
            pages_in_memory: 6,
            ..LogConfig::default()
        })
        .await
        .unwrap();

        for payload in &payloads {
            let _ = log.enqueue_async(payload).await.unwrap();
        }
        log.commit().await.unwrap();
        log.wait_for_commit(0).await.unwrap();
    }

    let log = Log::open(LogConfig {
        directory: dir.path().to_path_buf(),
        page_size_bits: 14,
        pages_in_memory: 6,
        ..LogConfig::default()
    })
    .await
    .unwrap();

    let mut scan = log.scan(0, None);
    let mut read_back = Vec::new();
    while let Some((_addr, payload)) = scan.next().await.unwrap() {
        read_back.push(payload);
    }

    assert_eq!(read_back, payloads);
}
