//! Mock collaborators and a trivial game for testing channels without a chain.

mod addition;
pub use self::addition::{AdditionChannel, AdditionRules, AdditionState, FINAL_NUMBER};

mod collaborators;
pub use self::collaborators::{
    test_metadata, MockBroadcast, MockMoveSender, MockSigner, MockVerifier, ALICE, BOB,
};
