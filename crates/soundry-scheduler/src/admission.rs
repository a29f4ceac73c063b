//! Admission of new requests.
//!
//! A submission is validated and classified, then persisted as queued
//! tracks referenced by the session. No download happens here; the
//! dispatcher picks the work up on its next run.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use soundry_media::PlaylistSource;
use soundry_models::{
    AudioFormat, Clock, GroupId, ItemSource, ProviderRef, SessionGroup, SessionItem, SessionItemId,
    SourceUrl, Track,
};
use soundry_queue::{DispatchNotifier, DispatchReason};
use soundry_store::{RemovedItem, SessionRepository, TrackRepository};
use tracing::{debug, info, warn};

use crate::error::{AdmissionError, AdmissionResult};
use crate::metrics;

/// What a submission created.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Present for playlist and album URLs.
    pub group: Option<SessionGroup>,
    pub items: Vec<SessionItem>,
}

struct Candidate {
    source: ProviderRef,
    title: Option<String>,
    artist: Option<String>,
}

pub struct Admission {
    tracks: Arc<dyn TrackRepository>,
    sessions: Arc<dyn SessionRepository>,
    playlists: Arc<dyn PlaylistSource>,
    notifier: Arc<dyn DispatchNotifier>,
    clock: Arc<dyn Clock>,
}

impl Admission {
    pub fn new(
        tracks: Arc<dyn TrackRepository>,
        sessions: Arc<dyn SessionRepository>,
        playlists: Arc<dyn PlaylistSource>,
        notifier: Arc<dyn DispatchNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracks,
            sessions,
            playlists,
            notifier,
            clock,
        }
    }

    /// Accept `url` on behalf of `session_token`.
    ///
    /// Single-track URLs become one queued track; playlists and albums are
    /// expanded into a [`SessionGroup`] with one track per entry. A track
    /// whose artifacts are still available is linked instead of queued
    /// again. Formats default to mp3.
    pub async fn submit(
        &self,
        session_token: &str,
        url: &str,
        formats: &[AudioFormat],
    ) -> AdmissionResult<Submission> {
        let session_token = session_token.trim();
        if session_token.is_empty() {
            return Err(AdmissionError::MissingSession);
        }
        let source = SourceUrl::parse(url)?;
        let formats = dedupe_formats(formats);
        let now = self.clock.now();

        let submission = match source.track_ref() {
            Some(track_ref) => {
                let candidate = Candidate {
                    source: track_ref,
                    title: None,
                    artist: None,
                };
                let item = self.admit(session_token, candidate, None, &formats, now).await?;
                metrics::record_submission("track", 1);
                Submission {
                    group: None,
                    items: vec![item],
                }
            }
            None => self.admit_collection(session_token, &source, &formats, now).await?,
        };

        info!(
            session = session_token,
            url = %source.url,
            items = submission.items.len(),
            group_id = ?submission.group.as_ref().map(|g| g.id.as_str()),
            "Accepted submission"
        );
        self.trigger(DispatchReason::Submitted).await;
        Ok(submission)
    }

    async fn admit_collection(
        &self,
        session_token: &str,
        source: &SourceUrl,
        formats: &[AudioFormat],
        now: DateTime<Utc>,
    ) -> AdmissionResult<Submission> {
        let playlist = self.playlists.expand(source).await?;

        let mut seen = HashSet::new();
        let candidates: Vec<Candidate> = playlist
            .entries
            .into_iter()
            .filter(|entry| seen.insert(entry.source.clone()))
            .map(|entry| Candidate {
                source: entry.source,
                title: entry.title,
                artist: entry.artist,
            })
            .collect();
        if candidates.is_empty() {
            return Err(AdmissionError::EmptyPlaylist(source.url.clone()));
        }

        let total = u32::try_from(candidates.len()).unwrap_or(u32::MAX);
        let group = SessionGroup::new(session_token, playlist.title, total, now);
        self.sessions.create_group(&group).await?;

        let mut items = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let item = self
                .admit(session_token, candidate, Some(group.id.clone()), formats, now)
                .await?;
            items.push(item);
        }
        metrics::record_submission("playlist", items.len());

        Ok(Submission {
            group: Some(group),
            items,
        })
    }

    async fn admit(
        &self,
        session_token: &str,
        candidate: Candidate,
        group_id: Option<GroupId>,
        formats: &[AudioFormat],
        now: DateTime<Utc>,
    ) -> AdmissionResult<SessionItem> {
        if let Some(existing) = self.tracks.find_available(&candidate.source, now).await? {
            debug!(track_id = %existing.id, source = %candidate.source, "Linking available track");
            let item =
                SessionItem::new(session_token, existing.id, group_id, ItemSource::Downloaded, now);
            return self.store_item(item).await;
        }

        let track = Track::queued(candidate.source, formats.to_vec(), now)
            .with_title(candidate.title, candidate.artist);
        self.tracks.create_track(&track).await?;
        let item = SessionItem::new(session_token, track.id, group_id, ItemSource::Requested, now);
        self.store_item(item).await
    }

    /// Store `item`, or hand back the session's existing link to the same
    /// track when there already is one.
    async fn store_item(&self, item: SessionItem) -> AdmissionResult<SessionItem> {
        if self.sessions.create_item(&item).await? {
            return Ok(item);
        }
        debug!(track_id = %item.track_id, "Session already holds this track");
        self.sessions
            .items_for_track(&item.track_id)
            .await?
            .into_iter()
            .find(|stored| stored.session_token == item.session_token)
            .ok_or_else(|| AdmissionError::not_found("Session item", item.id.as_str()))
    }

    /// Delete one of the session's items. The track is cancelled when this
    /// was its last reference and it had not finished yet.
    pub async fn remove_item(
        &self,
        session_token: &str,
        item_id: &SessionItemId,
    ) -> AdmissionResult<RemovedItem> {
        let owned = self
            .sessions
            .get_item(item_id)
            .await?
            .is_some_and(|item| item.session_token == session_token);
        if !owned {
            return Err(AdmissionError::not_found("Session item", item_id.as_str()));
        }

        let removed = self
            .sessions
            .remove_item(item_id)
            .await?
            .ok_or_else(|| AdmissionError::not_found("Session item", item_id.as_str()))?;
        if removed.track_cancelled {
            info!(track_id = %removed.track_id, "Track cancelled after its last item was removed");
        }
        Ok(removed)
    }

    /// Pause or resume a group. Paused groups are skipped by the dispatcher;
    /// work already processing is left alone.
    pub async fn set_group_paused(
        &self,
        session_token: &str,
        group_id: &GroupId,
        paused: bool,
    ) -> AdmissionResult<()> {
        let owned = self
            .sessions
            .get_group(group_id)
            .await?
            .is_some_and(|group| group.session_token == session_token);
        if !owned {
            return Err(AdmissionError::not_found("Group", group_id.as_str()));
        }

        self.sessions.set_group_paused(group_id, paused).await?;
        info!(group_id = %group_id, paused, "Group pause state changed");
        if !paused {
            self.trigger(DispatchReason::Resumed).await;
        }
        Ok(())
    }

    async fn trigger(&self, reason: DispatchReason) {
        // The periodic run picks the work up if the trigger is lost.
        if let Err(e) = self.notifier.notify(reason).await {
            warn!(reason = reason.as_str(), error = %e, "Failed to publish dispatch trigger");
        }
    }
}

/// Keep the first occurrence of each format.
fn dedupe_formats(formats: &[AudioFormat]) -> Vec<AudioFormat> {
    let mut out = Vec::with_capacity(formats.len());
    for format in formats {
        if !out.contains(format) {
            out.push(*format);
        }
    }
    out
}
