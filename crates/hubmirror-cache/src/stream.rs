//! Range responses assembled from cached blocks and upstream fetches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use hubmirror_core::{
    ByteStream, ByteWindow, FileIdentity, FileResponse, MirrorError, MirrorErrorKind,
    MirrorResult, RangePlan, RequestMethod, ResponseStatus, UpstreamFetch, etag_value,
};
use tracing::{debug, trace, warn};

use crate::CacheOps;
use crate::block::{BlockCache, BlockClaim, FetchTicket};

/// How long a request waits on another request's fetch of a block before fetching it itself.
pub const DEFAULT_CLAIM_WAIT: Duration = Duration::from_secs(15);

/// Serves HTTP range requests for one cached remote file.
pub struct CacheOrchestrator<C> {
    cache: Arc<BlockCache<C>>,
    upstream: Option<Arc<dyn UpstreamFetch>>,
    claim_wait: Duration,
}

impl<C> Clone for CacheOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            upstream: self.upstream.clone(),
            claim_wait: self.claim_wait,
        }
    }
}

impl<C> CacheOrchestrator<C>
where
    C: CacheOps + 'static,
{
    /// `upstream` is `None` when running offline; absent blocks then fail the request.
    pub fn new(cache: Arc<BlockCache<C>>, upstream: Option<Arc<dyn UpstreamFetch>>) -> Self {
        Self {
            cache,
            upstream,
            claim_wait: DEFAULT_CLAIM_WAIT,
        }
    }

    /// Bound on waiting for a block another request claimed. The fetching request only makes
    /// progress while its client reads, so a stalled client must not hold up everyone else.
    pub fn with_claim_wait(mut self, claim_wait: Duration) -> Self {
        self.claim_wait = claim_wait;
        self
    }

    pub fn cache(&self) -> &Arc<BlockCache<C>> {
        &self.cache
    }

    /// Build the response for `range_header` against the cached file.
    ///
    /// Headers are final when this returns. The body, when present, reads cached blocks and
    /// fetches missing ones lazily as it is polled.
    pub async fn respond(
        &self,
        identity: &FileIdentity,
        range_header: Option<&str>,
        method: RequestMethod,
    ) -> MirrorResult<FileResponse> {
        let file_size = self.cache.file_size();
        let plan = RangePlan::new(range_header, file_size)?;
        let etag = etag_value(self.cache.created_unix_secs(), file_size);
        let commit = (!identity.commit.is_empty()).then_some(identity.commit.as_str());
        let headers = plan.headers(&etag, commit);
        debug!(
            identity = %identity,
            status = ?plan.status,
            windows = plan.windows.len(),
            content_length = plan.content_length,
            "serving cached file"
        );

        if plan.status == ResponseStatus::Unsatisfiable || method == RequestMethod::Head {
            return Ok(FileResponse {
                status: plan.status,
                headers,
                body: None,
            });
        }

        if self.upstream.is_none() {
            let block_size = self.cache.block_size();
            for window in &plan.windows {
                let first = window.start / block_size;
                let end = window.end.div_ceil(block_size);
                if !self.cache.all_present(first, end).await {
                    return Err(MirrorError::with_message(
                        MirrorErrorKind::Unavailable,
                        format!("{identity} is not fully cached and upstream is offline"),
                    ));
                }
            }
        }

        let body = BodyState {
            cache: Arc::clone(&self.cache),
            upstream: self.upstream.clone(),
            identity: identity.clone(),
            claim_wait: self.claim_wait,
            windows: plan.windows.into_iter().collect(),
            current: None,
            active: None,
        };
        Ok(FileResponse {
            status: plan.status,
            headers,
            body: Some(body.into_stream()),
        })
    }
}

/// Block being fetched by this request. It carries no ticket when another request holds the
/// claim but stopped making progress.
struct PendingBlock {
    index: u64,
    _ticket: Option<FetchTicket>,
}

impl PendingBlock {
    fn claimed(ticket: FetchTicket) -> Self {
        Self {
            index: ticket.block(),
            _ticket: Some(ticket),
        }
    }

    fn unclaimed(index: u64) -> Self {
        Self {
            index,
            _ticket: None,
        }
    }
}

/// Upstream fetch covering one run of blocks.
struct ActiveFetch {
    stream: ByteStream,
    blocks: VecDeque<PendingBlock>,
    buffer: Vec<u8>,
    position: u64,
    end: u64,
}

struct BodyState<C> {
    cache: Arc<BlockCache<C>>,
    upstream: Option<Arc<dyn UpstreamFetch>>,
    identity: FileIdentity,
    claim_wait: Duration,
    windows: VecDeque<ByteWindow>,
    /// Unsent remainder of the window being served.
    current: Option<ByteWindow>,
    active: Option<ActiveFetch>,
}

impl<C> BodyState<C>
where
    C: CacheOps + 'static,
{
    fn into_stream(self) -> ByteStream {
        stream::try_unfold(self, |state| state.next_chunk()).boxed()
    }

    async fn next_chunk(mut self) -> MirrorResult<Option<(Bytes, Self)>> {
        loop {
            if self.active.is_some() {
                if let Some(chunk) = self.pump_upstream().await? {
                    return Ok(Some((chunk, self)));
                }
                continue;
            }

            let window = match self.current {
                Some(window) if !window.is_empty() => window,
                _ => match self.windows.pop_front() {
                    Some(window) => {
                        self.current = Some(window);
                        continue;
                    }
                    None => return Ok(None),
                },
            };

            let block_size = self.cache.block_size();
            let block = window.start / block_size;
            match self.cache.claim_block(block).await? {
                BlockClaim::Present => {
                    // A truncated block is invalidated by the read; the next pass claims it.
                    if let Some(data) = self.cache.read_block(block).await? {
                        let chunk = self.take_overlap(block * block_size, &data);
                        if let Some(chunk) = chunk {
                            return Ok(Some((chunk, self)));
                        }
                    }
                }
                BlockClaim::Wait(rx) => {
                    trace!(block, "waiting for concurrent fetch");
                    if tokio::time::timeout(self.claim_wait, rx).await.is_err() {
                        warn!(
                            identity = %self.identity,
                            block,
                            wait_ms = self.claim_wait.as_millis() as u64,
                            "concurrent fetch stalled; fetching block directly"
                        );
                        self.start_fetch(window, PendingBlock::unclaimed(block)).await?;
                    }
                }
                BlockClaim::Fetch(ticket) => {
                    self.start_fetch(window, PendingBlock::claimed(ticket)).await?
                }
            }
        }
    }

    /// Claim the run of missing blocks following `first` inside `window` and open one
    /// upstream request for exactly their extent.
    async fn start_fetch(&mut self, window: ByteWindow, first: PendingBlock) -> MirrorResult<()> {
        let Some(upstream) = self.upstream.clone() else {
            return Err(MirrorError::with_message(
                MirrorErrorKind::Unavailable,
                format!("{} is not cached and upstream is offline", self.identity),
            ));
        };
        let block_size = self.cache.block_size();
        let last_block = (window.end - 1) / block_size;
        let first_block = first.index;
        let mut blocks = VecDeque::from([first]);
        let mut next = first_block + 1;
        while next <= last_block {
            match self.cache.claim_block(next).await? {
                BlockClaim::Fetch(ticket) => {
                    blocks.push_back(PendingBlock::claimed(ticket));
                    next += 1;
                }
                _ => break,
            }
        }

        let start = first_block * block_size;
        let end = (next * block_size).min(self.cache.file_size());
        debug!(
            identity = %self.identity,
            first_block,
            blocks = blocks.len(),
            start,
            end,
            "fetching missing blocks from upstream"
        );
        let stream = upstream.fetch_range(&self.identity, start, end).await?;
        let first_len = self.cache.block_len(first_block)? as usize;
        self.active = Some(ActiveFetch {
            stream,
            blocks,
            buffer: Vec::with_capacity(first_len),
            position: start,
            end,
        });
        Ok(())
    }

    /// Pull one upstream chunk, persist any blocks it completes and return the part that
    /// overlaps the current window.
    async fn pump_upstream(&mut self) -> MirrorResult<Option<Bytes>> {
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };
        let chunk = match active.stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                self.active = None;
                return Err(err);
            }
            None => {
                let (position, end) = (active.position, active.end);
                self.active = None;
                if position < end {
                    return Err(MirrorError::with_message(
                        MirrorErrorKind::Unavailable,
                        format!("upstream ended at byte {position}, expected {end}"),
                    ));
                }
                return Ok(None);
            }
        };
        if chunk.is_empty() {
            return Ok(None);
        }

        let chunk_start = active.position;
        let chunk_end = chunk_start + chunk.len() as u64;
        if chunk_end > active.end {
            self.active = None;
            return Err(MirrorError::with_message(
                MirrorErrorKind::Unavailable,
                format!("upstream sent {} bytes past the requested range", chunk_end - chunk_start),
            ));
        }
        active.position = chunk_end;

        let mut rest = &chunk[..];
        while !rest.is_empty() {
            let Some(pending) = active.blocks.front() else {
                break;
            };
            let block = pending.index;
            let block_len = self.cache.block_len(block)? as usize;
            let take = (block_len - active.buffer.len()).min(rest.len());
            active.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if active.buffer.len() == block_len {
                self.cache.write_block(block, &active.buffer).await?;
                active.buffer.clear();
                active.blocks.pop_front();
            }
        }
        if chunk_end >= active.end {
            self.active = None;
        }

        Ok(self.take_overlap(chunk_start, &chunk))
    }

    /// Slice of `data` (starting at absolute `offset`) that falls inside the current window.
    /// Advances the window past the returned bytes.
    fn take_overlap(&mut self, offset: u64, data: &Bytes) -> Option<Bytes> {
        let window = self.current.as_mut()?;
        let start = window.start.max(offset);
        let end = window.end.min(offset + data.len() as u64);
        if start >= end {
            return None;
        }
        window.start = end;
        Some(data.slice((start - offset) as usize..(end - offset) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::CacheOrchestrator;
    use crate::{BlockCache, MemoryCacheOps};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use futures::stream;
    use hubmirror_core::{
        ByteStream, FileIdentity, FileResponse, MirrorError, MirrorErrorKind, MirrorResult,
        RepoType, RequestMethod, ResponseStatus, UpstreamFetch,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    const MIB: u64 = 1024 * 1024;
    const FILE_SIZE: u64 = 10 * MIB;
    const CHUNK: usize = 300_000;

    struct FakeUpstream {
        data: Vec<u8>,
        calls: Mutex<Vec<(u64, u64)>>,
        gate: Option<Arc<Notify>>,
        fail: AtomicBool,
    }

    impl FakeUpstream {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                calls: Mutex::new(Vec::new()),
                gate: None,
                fail: AtomicBool::new(false),
            }
        }

        fn gated(data: Vec<u8>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(data)
            }
        }

        fn calls(&self) -> Vec<(u64, u64)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl UpstreamFetch for FakeUpstream {
        async fn fetch_range(
            &self,
            _identity: &FileIdentity,
            start: u64,
            end_exclusive: u64,
        ) -> MirrorResult<ByteStream> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((start, end_exclusive));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let bytes = Bytes::copy_from_slice(&self.data[start as usize..end_exclusive as usize]);
            if self.fail.load(Ordering::SeqCst) {
                // Half of the data, then a transport failure.
                let half = bytes.slice(..bytes.len() / 2);
                return Ok(stream::iter(vec![
                    Ok(half),
                    Err(MirrorError::with_message(
                        MirrorErrorKind::Unavailable,
                        "connection reset",
                    )),
                ])
                .boxed());
            }
            let chunks = bytes
                .chunks(CHUNK)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>();
            Ok(stream::iter(chunks).boxed())
        }
    }

    fn file_bytes() -> Vec<u8> {
        (0..FILE_SIZE as usize)
            .map(|i| (i % 251) as u8 ^ (i >> 16) as u8)
            .collect()
    }

    fn identity() -> FileIdentity {
        FileIdentity::new(
            RepoType::Models,
            Some("acme".into()),
            "big-model",
            "0123abcd",
            "model.safetensors",
        )
    }

    async fn setup(
        upstream: Arc<FakeUpstream>,
    ) -> (Arc<BlockCache<MemoryCacheOps>>, CacheOrchestrator<MemoryCacheOps>) {
        let cache = Arc::new(
            BlockCache::open_or_create(MemoryCacheOps::new(), FILE_SIZE, MIB)
                .await
                .expect("create cache"),
        );
        let upstream: Arc<dyn UpstreamFetch> = upstream;
        let orchestrator = CacheOrchestrator::new(Arc::clone(&cache), Some(upstream));
        (cache, orchestrator)
    }

    async fn collect(response: FileResponse) -> MirrorResult<Vec<u8>> {
        let mut body = response.body.expect("body");
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn cached_block_is_served_without_upstream() {
        let data = file_bytes();
        let upstream = Arc::new(FakeUpstream::new(data.clone()));
        let (cache, orchestrator) = setup(Arc::clone(&upstream)).await;
        cache
            .write_block(0, &data[..MIB as usize])
            .await
            .expect("seed block 0");

        let response = orchestrator
            .respond(&identity(), Some("bytes=0-1048575"), RequestMethod::Get)
            .await
            .expect("respond");
        assert_eq!(response.status, ResponseStatus::Partial);
        assert_eq!(response.header("content-length"), Some("1048576"));
        assert_eq!(response.header("content-range"), Some("bytes 0-1048575/10485760"));
        assert_eq!(response.header("x-repo-commit"), Some("0123abcd"));

        let body = collect(response).await.expect("body");
        assert_eq!(body, &data[..MIB as usize]);
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_blocks_are_fetched_once_and_persisted() {
        let data = file_bytes();
        let upstream = Arc::new(FakeUpstream::new(data.clone()));
        let (cache, orchestrator) = setup(Arc::clone(&upstream)).await;

        let range = "bytes=2097152-4194303";
        let response = orchestrator
            .respond(&identity(), Some(range), RequestMethod::Get)
            .await
            .expect("respond");
        let body = collect(response).await.expect("body");
        assert_eq!(body, &data[2 * MIB as usize..4 * MIB as usize]);
        assert_eq!(upstream.calls(), vec![(2 * MIB, 4 * MIB)]);
        assert!(cache.is_present(2).await.expect("bit 2"));
        assert!(cache.is_present(3).await.expect("bit 3"));

        let response = orchestrator
            .respond(&identity(), Some(range), RequestMethod::Get)
            .await
            .expect("respond again");
        let body = collect(response).await.expect("body again");
        assert_eq!(body, &data[2 * MIB as usize..4 * MIB as usize]);
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn unaligned_windows_mix_cache_and_upstream() {
        let data = file_bytes();
        let upstream = Arc::new(FakeUpstream::new(data.clone()));
        let (cache, orchestrator) = setup(Arc::clone(&upstream)).await;
        cache
            .write_block(1, &data[MIB as usize..2 * MIB as usize])
            .await
            .expect("seed block 1");

        let response = orchestrator
            .respond(&identity(), Some("bytes=1500000-3200000,-100"), RequestMethod::Get)
            .await
            .expect("respond");
        // Suffix wins over explicit ranges.
        assert_eq!(response.header("content-range"), Some("bytes -100/10485760"));
        let body = collect(response).await.expect("body");
        assert_eq!(body, &data[FILE_SIZE as usize - 100..]);
        assert_eq!(upstream.calls(), vec![(9 * MIB, 10 * MIB)]);

        let response = orchestrator
            .respond(&identity(), Some("bytes=1500000-3200000"), RequestMethod::Get)
            .await
            .expect("respond");
        let body = collect(response).await.expect("body");
        assert_eq!(body, &data[1_500_000..=3_200_000]);
        assert_eq!(upstream.calls()[1], (2 * MIB, 4 * MIB));
        assert!(cache.is_present(3).await.expect("bit 3"));
    }

    #[tokio::test]
    async fn head_and_unsatisfiable_requests_have_no_body() {
        let upstream = Arc::new(FakeUpstream::new(file_bytes()));
        let (_cache, orchestrator) = setup(Arc::clone(&upstream)).await;

        let head = orchestrator
            .respond(&identity(), None, RequestMethod::Head)
            .await
            .expect("head");
        assert_eq!(head.status, ResponseStatus::Full);
        assert_eq!(head.header("content-length"), Some("10485760"));
        assert!(head.body.is_none());

        let unsatisfiable = orchestrator
            .respond(&identity(), Some("bytes=20000000-"), RequestMethod::Get)
            .await
            .expect("unsatisfiable");
        assert_eq!(unsatisfiable.status, ResponseStatus::Unsatisfiable);
        assert_eq!(unsatisfiable.header("content-range"), Some("bytes */10485760"));
        assert!(unsatisfiable.body.is_none());
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn offline_missing_block_is_unavailable() {
        let data = file_bytes();
        let cache = Arc::new(
            BlockCache::open_or_create(MemoryCacheOps::new(), FILE_SIZE, MIB)
                .await
                .expect("create cache"),
        );
        cache
            .write_block(0, &data[..MIB as usize])
            .await
            .expect("seed");
        let orchestrator = CacheOrchestrator::new(Arc::clone(&cache), None);

        let ok = orchestrator
            .respond(&identity(), Some("bytes=0-99"), RequestMethod::Get)
            .await
            .expect("cached range");
        assert_eq!(collect(ok).await.expect("body"), &data[..100]);

        let err = orchestrator
            .respond(&identity(), Some("bytes=0-2000000"), RequestMethod::Get)
            .await
            .expect_err("offline miss");
        assert_eq!(err.kind(), MirrorErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_block_absent() {
        let data = file_bytes();
        let upstream = Arc::new(FakeUpstream::new(data.clone()));
        upstream.fail.store(true, Ordering::SeqCst);
        let (cache, orchestrator) = setup(Arc::clone(&upstream)).await;

        let response = orchestrator
            .respond(&identity(), Some("bytes=5242880-6291455"), RequestMethod::Get)
            .await
            .expect("respond");
        let err = collect(response).await.expect_err("upstream failure");
        assert_eq!(err.kind(), MirrorErrorKind::Unavailable);
        assert!(!cache.is_present(5).await.expect("bit 5"));

        upstream.fail.store(false, Ordering::SeqCst);
        let response = orchestrator
            .respond(&identity(), Some("bytes=5242880-6291455"), RequestMethod::Get)
            .await
            .expect("retry");
        assert_eq!(
            collect(response).await.expect("body"),
            &data[5 * MIB as usize..6 * MIB as usize]
        );
        assert!(cache.is_present(5).await.expect("bit 5"));
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let data = file_bytes();
        let gate = Arc::new(Notify::new());
        let upstream = Arc::new(FakeUpstream::gated(data.clone(), Arc::clone(&gate)));
        let (_cache, orchestrator) = setup(Arc::clone(&upstream)).await;

        let first = {
            let orchestrator = orchestrator.clone();
            async move {
                let response = orchestrator
                    .respond(&identity(), Some("bytes=3145728-4194303"), RequestMethod::Get)
                    .await?;
                collect(response).await
            }
        };
        let second = {
            let orchestrator = orchestrator.clone();
            async move {
                let response = orchestrator
                    .respond(&identity(), Some("bytes=3145728-4194303"), RequestMethod::Get)
                    .await?;
                collect(response).await
            }
        };
        let release = async {
            tokio::task::yield_now().await;
            gate.notify_one();
        };

        let (first, second, ()) = tokio::join!(first, second, release);
        let expected = &data[3 * MIB as usize..4 * MIB as usize];
        assert_eq!(first.expect("first body"), expected);
        assert_eq!(second.expect("second body"), expected);
        assert_eq!(upstream.calls(), vec![(3 * MIB, 4 * MIB)]);
    }

    #[tokio::test]
    async fn dropped_body_keeps_only_complete_blocks() {
        let data = file_bytes();
        let upstream = Arc::new(FakeUpstream::new(data.clone()));
        let (cache, orchestrator) = setup(Arc::clone(&upstream)).await;

        let response = orchestrator
            .respond(&identity(), Some("bytes=0-2097151"), RequestMethod::Get)
            .await
            .expect("respond");
        let mut body = response.body.expect("body");
        // Four upstream chunks end partway into block 1.
        let mut received = 0;
        while received < 4 * CHUNK {
            received += body.next().await.expect("chunk").expect("bytes").len();
        }
        drop(body);
        assert!(cache.is_present(0).await.expect("bit 0"));
        assert!(!cache.is_present(1).await.expect("bit 1"));

        let response = orchestrator
            .respond(&identity(), Some("bytes=0-2097151"), RequestMethod::Get)
            .await
            .expect("respond again");
        assert_eq!(
            collect(response).await.expect("body"),
            &data[..2 * MIB as usize]
        );
        assert_eq!(upstream.calls(), vec![(0, 2 * MIB), (MIB, 2 * MIB)]);
        assert!(cache.is_present(1).await.expect("bit 1"));
    }

    #[tokio::test]
    async fn stalled_reader_does_not_hold_up_other_requests() {
        let data = file_bytes();
        let upstream = Arc::new(FakeUpstream::new(data.clone()));
        let (cache, orchestrator) = setup(Arc::clone(&upstream)).await;
        let orchestrator = orchestrator.with_claim_wait(Duration::from_millis(50));

        let stalled = orchestrator
            .respond(&identity(), Some("bytes=0-1048575"), RequestMethod::Get)
            .await
            .expect("respond");
        let mut stalled_body = stalled.body.expect("body");
        let first = stalled_body.next().await.expect("chunk").expect("bytes");
        assert_eq!(first.len(), CHUNK);

        let other = tokio::time::timeout(Duration::from_secs(5), async {
            let response = orchestrator
                .respond(&identity(), Some("bytes=0-99"), RequestMethod::Get)
                .await?;
            collect(response).await
        })
        .await
        .expect("second request finished")
        .expect("second body");
        assert_eq!(other, &data[..100]);
        assert!(cache.is_present(0).await.expect("bit 0"));
        assert_eq!(upstream.calls(), vec![(0, MIB), (0, MIB)]);

        let mut rest = first.to_vec();
        while let Some(chunk) = stalled_body.next().await {
            rest.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(rest, &data[..MIB as usize]);
    }
}
