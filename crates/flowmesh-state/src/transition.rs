//! The state-transition primitive.
//!
//! Every lifecycle mutation in flowmesh goes through
//! [`StateStore::transition`]:
//!
//! 1. refuse edges the state machine does not define,
//! 2. take the advisory lock for the key,
//! 3. read the current value and fail if it is not in `from`,
//! 4. compare-and-swap it to `to`,
//! 5. on a lost race, re-read once and retry the swap if the new value is
//!    still an accepted source state.
//!
//! Step 5 is what keeps the primitive correct when the advisory lock is
//! not exclusive (another process, another store handle).

use tracing::{debug, error, warn};

use crate::error::{StateError, StateResult};
use crate::lifecycle::Lifecycle;
use crate::store::{Attached, StateStore};

impl StateStore {
    /// Move `key` from any state in `from` to `to`. Returns `Ok(false)` when
    /// the precondition is not met or the race was lost.
    pub fn transition<S: Lifecycle>(&self, key: &str, from: &[S], to: S) -> StateResult<bool> {
        self.transition_with(key, from, to, &[])
    }

    /// [`transition`](Self::transition) that commits `attached` in the same
    /// write transaction as the state change. A failed transition writes
    /// none of them.
    pub fn transition_with<S: Lifecycle>(
        &self,
        key: &str,
        from: &[S],
        to: S,
        attached: &[Attached<'_>],
    ) -> StateResult<bool> {
        if let Some(bad) = from.iter().find(|f| !S::permits(**f, to)) {
            return Err(StateError::IllegalTransition {
                key: key.to_string(),
                from: bad.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        self.locks.with(key, || -> StateResult<bool> {
            let Some(observed) = self.get(key)? else {
                error!(%key, to = %to.as_str(), "transition failed: key absent");
                return Ok(false);
            };
            if !accepts(from, &observed) {
                error!(
                    %key,
                    observed = %String::from_utf8_lossy(&observed),
                    to = %to.as_str(),
                    "transition failed: state not in source set"
                );
                return Ok(false);
            }
            self.swap_observed(key, &observed, from, to, attached)
        })
    }

    /// CAS from an already observed value, with the single re-read retry.
    fn swap_observed<S: Lifecycle>(
        &self,
        key: &str,
        observed: &[u8],
        from: &[S],
        to: S,
        attached: &[Attached<'_>],
    ) -> StateResult<bool> {
        let target = to.as_str().as_bytes();
        if self.compare_and_swap_with(key, Some(observed), target, attached)? {
            debug!(
                %key,
                from = %String::from_utf8_lossy(observed),
                to = %to.as_str(),
                "transition"
            );
            return Ok(true);
        }

        let current = self.get(key)?;
        if let Some(current) = current.as_deref() {
            if current != observed && accepts(from, current) {
                if self.compare_and_swap_with(key, Some(current), target, attached)? {
                    debug!(
                        %key,
                        from = %String::from_utf8_lossy(current),
                        to = %to.as_str(),
                        "transition after re-read"
                    );
                    return Ok(true);
                }
            }
        }

        error!(
            %key,
            expected = %String::from_utf8_lossy(observed),
            current = %current
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default(),
            to = %to.as_str(),
            "transition lost race"
        );
        Ok(false)
    }

    /// Unconditionally write the error state. This is the only state write
    /// that bypasses `transition`.
    pub fn force_state<S: Lifecycle>(&self, key: &str) -> StateResult<()> {
        warn!(%key, to = %S::ERROR.as_str(), "forcing state");
        self.put(key, S::ERROR.as_str().as_bytes())
    }
}

fn accepts<S: Lifecycle>(from: &[S], raw: &[u8]) -> bool {
    S::from_bytes(raw).is_some_and(|state| from.contains(&state))
}
