use crate::api::{find_playlist, PlaylistStore, PlaylistTarget};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Create or update `playlist_name` for `user` so it holds exactly `song_ids`,
/// then set its comment if it changed.
///
/// The song list is always submitted: an empty list against an existing
/// playlist clears it, which is the only way to empty one. The comment is
/// only written when it differs from what is stored, so repeated runs with
/// the same content issue no metadata update.
pub async fn reconcile_playlist(
    store: &dyn PlaylistStore,
    user: &str,
    playlist_name: &str,
    comment: &str,
    song_ids: &[String],
) -> Result<()> {
    let playlists = store
        .list_playlists(user)
        .await
        .with_context(|| format!("Failed to fetch playlists for user {}", user))?;
    let existing = find_playlist(&playlists, playlist_name);

    let target = match existing {
        Some(p) => PlaylistTarget::Existing(p.id.clone()),
        None => PlaylistTarget::New(playlist_name.to_string()),
    };
    debug!("Upserting playlist `{}` for {} with {} tracks ({:?})", playlist_name, user, song_ids.len(), target);

    let stored = store
        .create_playlist(user, &target, song_ids)
        .await
        .with_context(|| format!("Failed to create playlist `{}` for user {}", playlist_name, user))?;

    // Prefer what the backend reports after the upsert; fall back to what was listed before it.
    let (playlist_id, stored_comment) = match (&stored, existing) {
        (Some(p), Some(prev)) => (p.id.clone(), if p.comment.is_empty() { prev.comment.clone() } else { p.comment.clone() }),
        (Some(p), None) => (p.id.clone(), p.comment.clone()),
        (None, Some(prev)) => (prev.id.clone(), prev.comment.clone()),
        (None, None) => {
            let playlists = store
                .list_playlists(user)
                .await
                .with_context(|| format!("Failed to fetch playlists for user {}", user))?;
            match find_playlist(&playlists, playlist_name) {
                Some(p) => (p.id.clone(), p.comment.clone()),
                None => {
                    warn!(
                        "Playlist `{}` for user {} was not returned after creation; comment not set",
                        playlist_name, user
                    );
                    return Ok(());
                }
            }
        }
    };

    if stored_comment != comment {
        store
            .update_comment(user, &playlist_id, comment)
            .await
            .with_context(|| format!("Failed to update playlist `{}` for user {}", playlist_name, user))?;
        info!("Updated comment of playlist `{}` for user {}", playlist_name, user);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{LibraryCall, MockLibrary};
    use crate::models::LocalPlaylist;
    use std::sync::Mutex;

    /// Store whose create call never reports the playlist back.
    #[derive(Default)]
    struct SilentCreateStore {
        listed_after_create: Option<LocalPlaylist>,
        created: Mutex<bool>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl PlaylistStore for SilentCreateStore {
        async fn list_playlists(&self, _user: &str) -> Result<Vec<LocalPlaylist>> {
            let created = *self.created.lock().unwrap();
            Ok(if created { self.listed_after_create.clone().into_iter().collect() } else { Vec::new() })
        }

        async fn create_playlist(&self, _user: &str, target: &PlaylistTarget, song_ids: &[String]) -> Result<Option<LocalPlaylist>> {
            *self.created.lock().unwrap() = true;
            self.calls.lock().unwrap().push(format!("create {:?} {:?}", target, song_ids));
            Ok(None)
        }

        async fn update_comment(&self, _user: &str, playlist_id: &str, comment: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("comment {} {}", playlist_id, comment));
            Ok(())
        }
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn creates_by_name_when_missing() {
        let lib = MockLibrary::new();
        reconcile_playlist(&lib, "alice", "Jams", "c1", &ids(&["s1"])).await.unwrap();
        let writes = lib.write_calls();
        assert_eq!(
            writes[0],
            LibraryCall::CreatePlaylist {
                user: "alice".into(),
                target: PlaylistTarget::New("Jams".into()),
                song_ids: ids(&["s1"]),
            }
        );
        assert!(matches!(&writes[1], LibraryCall::UpdateComment { comment, .. } if comment == "c1"));
    }

    #[tokio::test]
    async fn second_identical_run_skips_comment_update() {
        let lib = MockLibrary::new();
        reconcile_playlist(&lib, "alice", "Jams", "same", &ids(&["s1", "s2"])).await.unwrap();
        reconcile_playlist(&lib, "alice", "Jams", "same", &ids(&["s1", "s2"])).await.unwrap();
        let updates = lib
            .write_calls()
            .into_iter()
            .filter(|c| matches!(c, LibraryCall::UpdateComment { .. }))
            .count();
        assert_eq!(updates, 1);
        assert!(lib.write_calls().iter().any(|c| matches!(
            c,
            LibraryCall::CreatePlaylist { target: PlaylistTarget::Existing(id), .. } if id == "mock-playlist-1"
        )));
    }

    #[tokio::test]
    async fn empty_list_clears_existing_playlist() {
        let lib = MockLibrary::new();
        lib.playlists.lock().unwrap().push(LocalPlaylist {
            id: "p9".into(),
            name: "Jams".into(),
            comment: "old".into(),
            song_count: 12,
            changed: None,
        });
        reconcile_playlist(&lib, "alice", "Jams", "old", &[]).await.unwrap();
        assert_eq!(
            lib.write_calls(),
            vec![LibraryCall::CreatePlaylist {
                user: "alice".into(),
                target: PlaylistTarget::Existing("p9".into()),
                song_ids: vec![],
            }]
        );
        assert_eq!(lib.playlists.lock().unwrap()[0].song_count, 0);
    }

    #[tokio::test]
    async fn write_failure_names_playlist_and_user() {
        let lib = MockLibrary { fail_writes: true, ..Default::default() };
        let err = reconcile_playlist(&lib, "bob", "Weekly", "c", &ids(&["s1"])).await.unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Weekly") && msg.contains("bob"), "{}", msg);
    }

    #[tokio::test]
    async fn unreported_creation_is_not_a_failure() {
        let store = SilentCreateStore::default();
        reconcile_playlist(&store, "alice", "Jams", "c", &ids(&["s1"])).await.unwrap();
        assert_eq!(*store.calls.lock().unwrap(), vec![r#"create New("Jams") ["s1"]"#.to_string()]);
    }

    #[tokio::test]
    async fn unreported_creation_is_found_by_name_for_the_comment() {
        let store = SilentCreateStore {
            listed_after_create: Some(LocalPlaylist {
                id: "p7".into(),
                name: "Jams".into(),
                comment: String::new(),
                song_count: 1,
                changed: None,
            }),
            ..Default::default()
        };
        reconcile_playlist(&store, "alice", "Jams", "c", &ids(&["s1"])).await.unwrap();
        assert_eq!(store.calls.lock().unwrap().last().unwrap(), "comment p7 c");
    }
}
