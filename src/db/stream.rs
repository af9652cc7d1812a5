//! Consumer-paced row streams.
//!
//! The driver hands out rows as fast as the socket delivers them. The bridge in
//! this module turns that into a pull-based [`RowStream`] with bounded
//! buffering:
//!
//! - A producer task owns the connection and pulls rows from the driver only
//!   while the bridge is *flowing*. Nothing is pulled before the consumer asks
//!   for the first row. A pool-bound stream also waits for that first pull to
//!   acquire its connection; a transaction-bound stream queues for the
//!   transaction's connection when it is created, so it runs in submission
//!   order with the statements around it.
//! - Each row goes into a buffer. Once the buffer holds `high_water_mark` rows
//!   the bridge is *paused* and the producer stops reading from the socket
//!   until the consumer drains below the mark.
//! - The stream terminates exactly once: ended, errored (the error carries the
//!   call site that created the stream) or canceled.
//! - Canceling (`close()` or dropping the stream) discards buffered rows and
//!   lets the producer run. It drains what is left of the result set without
//!   decoding it, so the connection goes back to the pool in a usable state.
//!   Nothing produced after the cancel reaches the consumer.

use crate::db::connection::{Lease, connection_mut};
use crate::db::statement::{RawItem, Statement};
use crate::db::types::RowDecoder;
use crate::error::{CallSite, DbError, DbResult};
use crate::models::{Row, RowShape};
use futures_util::stream::{BoxStream, FusedStream, Stream, StreamExt};
use parking_lot::Mutex;
use sqlx::{Either, MySqlPool};
use sqlx::mysql::MySqlConnection;
use std::collections::VecDeque;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::sync::watch;
use tracing::{Instrument, debug, debug_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Paused,
    Flowing,
}

#[derive(Debug)]
enum Terminal {
    Open,
    Ended,
    Errored(DbError),
    /// The consumer has seen the end or the error.
    Done,
}

#[derive(Debug)]
struct BridgeState {
    buffer: VecDeque<Row>,
    terminal: Terminal,
    canceled: bool,
    waker: Option<Waker>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BridgeState>,
    flow: watch::Sender<Flow>,
    high_water_mark: usize,
}

impl Shared {
    fn set_flow(&self, flow: Flow) {
        self.flow.send_if_modified(|current| {
            if *current == flow {
                false
            } else {
                *current = flow;
                true
            }
        });
    }

    fn cancel(&self) {
        let waker = {
            let mut state = self.state.lock();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.buffer.clear();
            state.waker.take()
        };
        // Let a paused producer run so it can notice the cancel and drain.
        self.set_flow(Flow::Flowing);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Create a connected producer/consumer pair. The bridge starts paused.
pub(crate) fn bridge(high_water_mark: usize, origin: CallSite) -> (RowSink, RowStream) {
    let (flow, flow_rx) = watch::channel(Flow::Paused);
    let shared = Arc::new(Shared {
        state: Mutex::new(BridgeState {
            buffer: VecDeque::new(),
            terminal: Terminal::Open,
            canceled: false,
            waker: None,
        }),
        flow,
        high_water_mark: high_water_mark.max(1),
    });
    let sink = RowSink {
        shared: Arc::clone(&shared),
        flow: flow_rx,
    };
    let stream = RowStream {
        shared,
        origin,
        finished: false,
    };
    (sink, stream)
}

/// Producer half of the bridge.
#[derive(Debug)]
pub(crate) struct RowSink {
    shared: Arc<Shared>,
    flow: watch::Receiver<Flow>,
}

impl RowSink {
    /// Wait until the consumer wants rows. Returns false once the stream is canceled.
    pub(crate) async fn ready(&mut self) -> bool {
        if self.is_canceled() {
            return false;
        }
        // The sender lives in `Shared`, which this sink keeps alive.
        let _flowing = self
            .flow
            .wait_for(|flow| *flow == Flow::Flowing)
            .await
            .is_ok();
        !self.is_canceled()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.shared.state.lock().canceled
    }

    /// Hand a row to the consumer. Returns false if it was discarded.
    pub(crate) fn push(&self, row: Row) -> bool {
        let waker = {
            let mut state = self.shared.state.lock();
            if state.canceled || !matches!(state.terminal, Terminal::Open) {
                return false;
            }
            state.buffer.push_back(row);
            if state.buffer.len() >= self.shared.high_water_mark {
                self.shared.set_flow(Flow::Paused);
            }
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Terminate the stream with an error.
    pub(crate) fn fail(&self, err: DbError) {
        self.terminate(Terminal::Errored(err));
    }

    /// Terminate the stream normally.
    pub(crate) fn end(&self) {
        self.terminate(Terminal::Ended);
    }

    fn terminate(&self, terminal: Terminal) {
        let waker = {
            let mut state = self.shared.state.lock();
            if state.canceled || !matches!(state.terminal, Terminal::Open) {
                if let Terminal::Errored(err) = &terminal {
                    debug!(error = %err, "Discarding error from a finished stream");
                }
                return;
            }
            state.terminal = terminal;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Drop for RowSink {
    fn drop(&mut self) {
        // A producer that panicked or was aborted must not leave the consumer hanging.
        let open = {
            let state = self.shared.state.lock();
            !state.canceled && matches!(state.terminal, Terminal::Open)
        };
        if open {
            warn!("Row producer stopped without finishing the stream");
            self.fail(DbError::internal("row producer stopped unexpectedly"));
        }
    }
}

/// A stream of rows from one statement, paced by the consumer.
///
/// Dropping the stream cancels it; the connection is drained and released in
/// the background.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct RowStream {
    shared: Arc<Shared>,
    origin: CallSite,
    finished: bool,
}

impl RowStream {
    /// Stop the stream early (idempotent). Buffered and later rows are discarded.
    pub fn close(&mut self) {
        self.finished = true;
        self.shared.cancel();
    }

    /// Number of rows buffered ahead of the consumer.
    pub fn buffered_rows(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Where the stream was created.
    pub fn origin(&self) -> CallSite {
        self.origin
    }

    /// Pull-one-at-a-time view of this stream.
    pub fn into_iterator(self) -> RowIterator {
        RowIterator { stream: self }
    }
}

impl Stream for RowStream {
    type Item = DbResult<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let shared = &this.shared;
        let mut state = shared.state.lock();
        if state.canceled {
            this.finished = true;
            return Poll::Ready(None);
        }

        if matches!(state.terminal, Terminal::Errored(_)) {
            let terminal = mem::replace(&mut state.terminal, Terminal::Done);
            state.buffer.clear();
            this.finished = true;
            if let Terminal::Errored(err) = terminal {
                return Poll::Ready(Some(Err(err.at(this.origin))));
            }
        }

        if let Some(row) = state.buffer.pop_front() {
            if state.buffer.len() < shared.high_water_mark
                && matches!(state.terminal, Terminal::Open)
            {
                shared.set_flow(Flow::Flowing);
            }
            return Poll::Ready(Some(Ok(row)));
        }

        match state.terminal {
            Terminal::Open => {
                state.waker = Some(cx.waker().clone());
                // Under the lock, or a push that fills the buffer could be overridden.
                shared.set_flow(Flow::Flowing);
                drop(state);
                Poll::Pending
            }
            _ => {
                state.terminal = Terminal::Done;
                this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

impl FusedStream for RowStream {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

/// Iterator-style access to a [`RowStream`].
///
/// ```no_run
/// # async fn demo(db: &mysql_queryable::Db) -> mysql_queryable::DbResult<()> {
/// let mut rows = db.iterator("SELECT * FROM test", ());
/// while let Some(row) = rows.next().await {
///     if row?.get("id") == Some(&serde_json::json!(3)) {
///         rows.close();
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RowIterator {
    stream: RowStream,
}

impl RowIterator {
    /// Next row, or `None` once the result set is exhausted or closed.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Option<DbResult<Row>> {
        self.stream.next().await
    }

    /// Stop iterating; same as [`RowStream::close`].
    pub fn close(&mut self) {
        self.stream.close();
    }

    pub fn into_stream(self) -> RowStream {
        self.stream
    }
}

/// Where a stream's producer finds its connection.
pub(crate) enum StreamSource {
    /// Acquire a pooled connection once the consumer asks for rows.
    Pool(MySqlPool),
    /// Use the connection a transaction holds.
    Connection(Lease),
}

/// Start the producer task for `statement`.
pub(crate) fn spawn_producer(
    source: StreamSource,
    statement: Statement,
    shape: RowShape,
    sink: RowSink,
) {
    let span = debug_span!("row_stream", sql = %statement.sql);
    tokio::spawn(produce(source, statement, shape, sink).instrument(span));
}

async fn produce(source: StreamSource, statement: Statement, shape: RowShape, mut sink: RowSink) {
    match source {
        StreamSource::Pool(pool) => {
            if !sink.ready().await {
                debug!("Stream canceled before it started");
                return;
            }
            match pool.acquire().await {
                Ok(mut conn) => pump(&mut conn, &statement, shape, &mut sink).await,
                Err(err) => sink.fail(err.into()),
            }
        }
        StreamSource::Connection(lease) => {
            // Hold the connection from the start so statements keep their order.
            let mut guard = lease.acquire().await;
            if !sink.ready().await {
                debug!("Stream canceled before it started");
                return;
            }
            match connection_mut(&mut guard) {
                Ok(conn) => pump(conn, &statement, shape, &mut sink).await,
                Err(err) => sink.fail(err),
            }
        }
    }
}

/// Move rows from the driver into the bridge while the consumer wants them.
async fn pump(
    conn: &mut MySqlConnection,
    statement: &Statement,
    shape: RowShape,
    sink: &mut RowSink,
) {
    debug!(
        params = statement.params.len(),
        prepared = statement.prepared,
        "Streaming statement"
    );
    let mut decoder = RowDecoder::new(shape);
    let mut results = statement.fetch_many(conn);
    let mut delivered: u64 = 0;

    loop {
        if !sink.ready().await {
            drain(results, delivered).await;
            return;
        }
        match results.next().await {
            Some(Ok(Either::Right(row))) => {
                if sink.push(decoder.decode(&row)) {
                    delivered += 1;
                }
            }
            Some(Ok(Either::Left(_))) => {}
            Some(Err(err)) => {
                sink.fail(err.into());
                return;
            }
            None => {
                debug!(rows = delivered, "Stream finished");
                sink.end();
                return;
            }
        }
    }
}

/// Read the rest of a canceled result set so the connection can be reused.
async fn drain(mut results: BoxStream<'_, RawItem>, delivered: u64) {
    let mut discarded: u64 = 0;
    while let Some(item) = results.next().await {
        match item {
            Ok(Either::Right(_)) => discarded += 1,
            Ok(Either::Left(_)) => {}
            Err(err) => {
                debug!(error = %err, "Error while draining a canceled stream");
                break;
            }
        }
    }
    debug!(
        rows = delivered,
        discarded, "Stream canceled, result set drained"
    );
}
