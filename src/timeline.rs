//! Live timeline: a filter-driven, newest-first event list model.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;

use crate::filter::Filter;
use crate::model::Model;
use crate::set::StoredEvent;
use crate::store::{ClaimGuard, EventStore};

/// Model producing the timeline for a filter set: every matching event,
/// newest first, recomputed whenever a relevant event is inserted,
/// updated, or removed.
///
/// The model claims every event in its current result so none of them
/// can be evicted out from under subscribers; claims are released as
/// events leave the result and when the model is torn down.
pub struct TimelineModel {
    filters: Vec<Filter>,
}

impl TimelineModel {
    pub fn new(filters: Vec<Filter>) -> Self {
        TimelineModel { filters }
    }

    /// Timeline for a single filter.
    pub fn filter(filter: Filter) -> Self {
        Self::new(vec![filter])
    }
}

impl Model for TimelineModel {
    type Output = Vec<StoredEvent>;

    fn key(&self) -> String {
        serde_json::Value::Array(self.filters.iter().map(|f| f.to_value()).collect()).to_string()
    }

    fn build(&self, store: &Arc<EventStore>) -> BoxStream<'static, Vec<StoredEvent>> {
        let store = store.clone();
        let filters = self.filters.clone();
        stream! {
            let mut rx = store.notices();
            let mut guards: HashMap<String, ClaimGuard> = HashMap::new();
            let timeline = store.get_timeline(&filters);
            sync_claims(&store, &timeline, &mut guards);
            yield timeline;
            loop {
                match rx.recv().await {
                    Ok(notice) => {
                        let ev = notice.event();
                        // Rebuilds are triggered by events matching the
                        // filters and by current members leaving (a
                        // removed member no longer matches id filters but
                        // still holds a claim guard).
                        if !Filter::matches_any(&filters, ev.event())
                            && !guards.contains_key(ev.id.as_str())
                        {
                            continue;
                        }
                        let timeline = store.get_timeline(&filters);
                        sync_claims(&store, &timeline, &mut guards);
                        yield timeline;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed notices; the full rebuild resynchronizes.
                        let timeline = store.get_timeline(&filters);
                        sync_claims(&store, &timeline, &mut guards);
                        yield timeline;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .boxed()
    }
}

/// Claim newly entered events and release the ones that left.
fn sync_claims(
    store: &Arc<EventStore>,
    timeline: &[StoredEvent],
    guards: &mut HashMap<String, ClaimGuard>,
) {
    guards.retain(|id, _| timeline.iter().any(|ev| &ev.id == id));
    for ev in timeline {
        guards
            .entry(ev.id.clone())
            .or_insert_with(|| store.claim_guard(ev));
    }
}
