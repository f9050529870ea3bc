use std::collections::HashSet;
use std::sync::Arc;

use symbio_core::{DocumentStatus, DocumentStore, DocumentType, NewDocument, Storage};

fn new_doc(n: usize) -> NewDocument {
    NewDocument::new(
        "epa",
        format!("https://example.org/report-{n}.html"),
        DocumentType::WebText,
        format!("{n:064x}"),
        format!("epa/{n:016x}.html"),
    )
}

#[tokio::test]
async fn test_same_hash_inserted_twice_yields_one_document() {
    let storage = Storage::open_memory().await.unwrap();

    let first = storage.insert(new_doc(1)).await.unwrap();
    let second = storage.insert(new_doc(1)).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert!(storage.contains_hash(&format!("{:064x}", 1)).await.unwrap());
    let counts = storage.count_by_status().await.unwrap();
    assert_eq!(counts, vec![(DocumentStatus::Pending, 1)]);
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("claims.db");
    let path = path.to_str().unwrap();

    let a = Arc::new(Storage::open(path).await.unwrap());
    let b = Arc::new(Storage::open(path).await.unwrap());
    for n in 0..40 {
        a.insert(new_doc(n)).await.unwrap().unwrap();
    }

    let mut handles = Vec::new();
    for store in [a.clone(), b.clone(), a.clone(), b.clone()] {
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = store.claim_pending(None, 3).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|d| d.id));
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();

    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(
        a.count_by_status().await.unwrap(),
        vec![(DocumentStatus::Processing, 40)]
    );
}

#[tokio::test]
async fn test_claim_returns_oldest_first() {
    let storage = Storage::open_memory().await.unwrap();
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(storage.insert(new_doc(n)).await.unwrap().unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let first = storage.claim_pending(None, 2).await.unwrap();
    let rest = storage.claim_pending(None, 10).await.unwrap();

    let order: Vec<_> = first.iter().chain(rest.iter()).map(|d| d.id).collect();
    assert_eq!(order, ids);
}

#[tokio::test]
async fn test_reopen_keeps_documents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    let path = path.to_str().unwrap();

    let id = {
        let storage = Storage::open(path).await.unwrap();
        storage.insert(new_doc(7)).await.unwrap().unwrap()
    };

    let storage = Storage::open(path).await.unwrap();
    let doc = storage.get_document(id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);
    assert_eq!(doc.source, "epa");
    assert!(storage.insert(new_doc(7)).await.unwrap().is_none());
}
