//! File-system session store.
//!
//! Layout under the root directory:
//!
//! ```text
//! anonymous/<session_id>/        sessions without a user
//! users/<user_id>/<session_id>/  sessions owned by a user
//!     session.json               metadata and transcript
//!     character_profile.txt      one trait per line
//!     evaluation.json            latest evaluator verdict
//!     final_prompt.md            writer output
//! ```

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::evaluation::Evaluation;
use crate::session::{Session, SessionMessage, SessionRef, SessionStatus};

const SESSION_FILE: &str = "session.json";
const PROFILE_FILE: &str = "character_profile.txt";
const EVALUATION_FILE: &str = "evaluation.json";
const FINAL_PROMPT_FILE: &str = "final_prompt.md";

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
    // Serialises read-modify-write cycles on session.json
    meta_lock: Arc<Mutex<()>>,
}

impl FileSessionStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("anonymous")).await?;
        fs::create_dir_all(root.join("users")).await?;
        info!(path = %root.display(), "Session store ready");
        Ok(Self {
            root,
            meta_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user_id: Option<&str>) -> Result<PathBuf> {
        match user_id {
            None | Some("anonymous") => Ok(self.root.join("anonymous")),
            Some(user) => {
                validate_id(user)?;
                Ok(self.root.join("users").join(user))
            }
        }
    }

    pub fn session_dir(&self, session: &SessionRef) -> Result<PathBuf> {
        validate_id(&session.id)?;
        Ok(self.user_dir(session.user_id.as_deref())?.join(&session.id))
    }

    pub async fn create_session(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.session_ref())?;
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(SESSION_FILE), &serde_json::to_vec_pretty(session)?).await?;
        let profile = dir.join(PROFILE_FILE);
        if !fs::try_exists(&profile).await? {
            fs::write(&profile, b"").await?;
        }
        info!(session_id = %session.id, user_id = ?session.user_id, "Created session");
        Ok(())
    }

    pub async fn get_session(&self, session: &SessionRef) -> Result<Session> {
        let path = self.session_dir(session)?.join(SESSION_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SessionNotFound(session.id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let loaded: Session = serde_json::from_slice(&bytes)?;
        // A session stored for another user is treated as absent
        if loaded.user_id.is_some() && loaded.user_id != session.user_id {
            return Err(Error::SessionNotFound(session.id.clone()));
        }
        Ok(loaded)
    }

    /// Sessions of one user, most recently updated first.
    pub async fn list_sessions(&self, user_id: Option<&str>, limit: usize, offset: usize) -> Result<Vec<Session>> {
        let dir = self.user_dir(user_id)?;
        let mut sessions = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(SESSION_FILE);
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session"),
                },
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping directory without session"),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    /// Overwrite stored metadata. The session must already exist.
    pub async fn update_session(&self, session: &mut Session) -> Result<()> {
        let _guard = self.meta_lock.lock().await;
        self.update_locked(session).await
    }

    async fn update_locked(&self, session: &mut Session) -> Result<()> {
        let session_ref = session.session_ref();
        // Existence and ownership check
        self.get_session(&session_ref).await?;
        session.updated_at = Utc::now();
        let path = self.session_dir(&session_ref)?.join(SESSION_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(session)?).await
    }

    async fn modify<F>(&self, session_ref: &SessionRef, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let _guard = self.meta_lock.lock().await;
        let mut session = self.get_session(session_ref).await?;
        f(&mut session);
        self.update_locked(&mut session).await?;
        Ok(session)
    }

    pub async fn rename_session(&self, session_ref: &SessionRef, name: String) -> Result<Session> {
        self.modify(session_ref, |s| s.name = name).await
    }

    pub async fn set_status(&self, session_ref: &SessionRef, status: SessionStatus) -> Result<Session> {
        self.modify(session_ref, |s| s.status = status).await
    }

    pub async fn add_message(&self, session_ref: &SessionRef, message: SessionMessage) -> Result<Session> {
        self.modify(session_ref, |s| s.push_message(message)).await
    }

    /// Returns false when there was nothing to delete.
    pub async fn delete_session(&self, session_ref: &SessionRef) -> Result<bool> {
        // Ownership check before touching the disk
        match self.get_session(session_ref).await {
            Ok(_) => {}
            Err(Error::SessionNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        let dir = self.session_dir(session_ref)?;
        fs::remove_dir_all(&dir).await?;
        info!(session_id = %session_ref.id, "Deleted session");
        Ok(true)
    }

    pub async fn append_trait(&self, session_ref: &SessionRef, trait_text: &str) -> Result<()> {
        let path = self.session_dir(session_ref)?.join(PROFILE_FILE);
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        // One trait per line so the revision equals the line count
        let line = trait_text.replace('\n', " ");
        file.write_all(format!("{}\n", line.trim()).as_bytes()).await?;
        file.flush().await?;
        debug!(session_id = %session_ref.id, "Appended trait");
        Ok(())
    }

    pub async fn load_profile(&self, session_ref: &SessionRef) -> Result<String> {
        read_optional(&self.session_dir(session_ref)?.join(PROFILE_FILE))
            .await
            .map(Option::unwrap_or_default)
    }

    pub async fn save_profile(&self, session_ref: &SessionRef, content: &str) -> Result<()> {
        write_atomic(&self.session_dir(session_ref)?.join(PROFILE_FILE), content.as_bytes()).await
    }

    /// Persist the verdict to evaluation.json and the session metadata.
    pub async fn record_evaluation(&self, session_ref: &SessionRef, evaluation: &Evaluation) -> Result<()> {
        let path = self.session_dir(session_ref)?.join(EVALUATION_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(evaluation)?).await?;
        let evaluation = evaluation.clone();
        self.modify(session_ref, |s| s.evaluation = Some(evaluation)).await?;
        Ok(())
    }

    pub async fn load_evaluation(&self, session_ref: &SessionRef) -> Result<Option<Evaluation>> {
        let Some(text) = read_optional(&self.session_dir(session_ref)?.join(EVALUATION_FILE)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(evaluation) => Ok(Some(evaluation)),
            Err(e) => {
                warn!(session_id = %session_ref.id, error = %e, "Ignoring unreadable evaluation");
                Ok(None)
            }
        }
    }

    pub async fn save_final_prompt(&self, session_ref: &SessionRef, content: &str) -> Result<PathBuf> {
        let path = self.session_dir(session_ref)?.join(FINAL_PROMPT_FILE);
        write_atomic(&path, content.as_bytes()).await?;
        info!(session_id = %session_ref.id, path = %path.display(), "Final prompt saved");
        Ok(path)
    }

    pub async fn load_final_prompt(&self, session_ref: &SessionRef) -> Result<Option<String>> {
        read_optional(&self.session_dir(session_ref)?.join(FINAL_PROMPT_FILE)).await
    }
}

/// Session and user ids become path components, so only a safe alphabet is accepted.
fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
