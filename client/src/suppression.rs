/// Echo guard for the local media element.
///
/// While a remote-originated correction is being applied, the element's own
/// play/pause/seeked callbacks must not be reported back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoGuard {
    #[default]
    Idle,
    ApplyingRemote { expires_at: i64 },
}

impl EchoGuard {
    /// Open (or extend) a suppression window of `window_ms` starting at `now`.
    pub fn arm(&mut self, now: i64, window_ms: i64) {
        let expires_at = now + window_ms.max(0);
        *self = match *self {
            EchoGuard::ApplyingRemote { expires_at: current } if current > expires_at => {
                EchoGuard::ApplyingRemote {
                    expires_at: current,
                }
            }
            _ => EchoGuard::ApplyingRemote { expires_at },
        };
    }

    /// Whether local events observed at `now` are echoes. Falls back to idle
    /// once the window has passed.
    pub fn is_suppressing(&mut self, now: i64) -> bool {
        match *self {
            EchoGuard::ApplyingRemote { expires_at } if now < expires_at => true,
            EchoGuard::ApplyingRemote { .. } => {
                *self = EchoGuard::Idle;
                false
            }
            EchoGuard::Idle => false,
        }
    }
}
