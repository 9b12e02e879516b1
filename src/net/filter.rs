//! Update filters
//!
//! A session's queue is drained by two kinds of updater: the world (main)
//! updater, which runs every session in turn and owns logout, and the map
//! updaters, which run in parallel and may only touch opcodes that are safe
//! off the main thread.

use crate::protocol::opcodes::ProcessingPlace;

/// Which updater is draining the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateFilter {
    /// World (main thread) update
    World,
    /// Map worker update
    Map,
}

impl UpdateFilter {
    /// Whether a packet may be handled by this updater
    ///
    /// `place` is `None` for unknown opcodes and `player_in_world` is `None`
    /// when no character is attached.
    pub fn accepts(self, place: Option<ProcessingPlace>, player_in_world: Option<bool>) -> bool {
        match self {
            UpdateFilter::World => match place {
                None | Some(ProcessingPlace::AnywhereSafe) | Some(ProcessingPlace::MainThreadOnly) => {
                    true
                }
                Some(ProcessingPlace::MapThreadSafe) => player_in_world != Some(true),
            },
            UpdateFilter::Map => match place {
                Some(ProcessingPlace::AnywhereSafe) => true,
                Some(ProcessingPlace::MapThreadSafe) => player_in_world == Some(true),
                None | Some(ProcessingPlace::MainThreadOnly) => false,
            },
        }
    }

    /// Only the world updater runs delayed logouts and socket teardown
    pub fn process_logout(self) -> bool {
        matches!(self, UpdateFilter::World)
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdateFilter::World => "world",
            UpdateFilter::Map => "map",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anywhere_safe_accepted_by_both() {
        let place = Some(ProcessingPlace::AnywhereSafe);
        assert!(UpdateFilter::World.accepts(place, None));
        assert!(UpdateFilter::Map.accepts(place, Some(true)));
        assert!(UpdateFilter::Map.accepts(place, None));
    }

    #[test]
    fn test_main_thread_only_never_on_map() {
        let place = Some(ProcessingPlace::MainThreadOnly);
        assert!(UpdateFilter::World.accepts(place, Some(true)));
        assert!(!UpdateFilter::Map.accepts(place, Some(true)));
    }

    #[test]
    fn test_map_thread_safe_follows_player() {
        let place = Some(ProcessingPlace::MapThreadSafe);

        // In world: the map updater owns it
        assert!(UpdateFilter::Map.accepts(place, Some(true)));
        assert!(!UpdateFilter::World.accepts(place, Some(true)));

        // Between maps or without a character: the world updater takes it
        assert!(!UpdateFilter::Map.accepts(place, Some(false)));
        assert!(UpdateFilter::World.accepts(place, Some(false)));
        assert!(UpdateFilter::World.accepts(place, None));
    }

    #[test]
    fn test_unknown_opcodes_go_to_world() {
        assert!(UpdateFilter::World.accepts(None, Some(true)));
        assert!(!UpdateFilter::Map.accepts(None, Some(true)));
    }

    #[test]
    fn test_process_logout() {
        assert!(UpdateFilter::World.process_logout());
        assert!(!UpdateFilter::Map.process_logout());
    }
}
