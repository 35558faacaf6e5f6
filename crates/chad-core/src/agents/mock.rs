//! Mock provider: a local shell script that emits canned agent output.
//!
//! Lets the whole pipeline; PTY spawn, milestone scanning, verification,
//! quota handover; run without real API calls. The script's output shapes
//! match what the session loop scanners expect.

use chad_protocol::Phase;

/// Shell script emitting canned output for the given phase.
///
/// Coding phases print an exploration marker, touch `BUGS.md` in the
/// working directory, and finish with a `change_summary` object. The
/// verification phase inspects `BUGS.md`: a first review fails (no
/// `REVIEWED` marker yet), a revision pass that added the marker passes.
pub fn mock_script(phase: Phase) -> String {
    match phase {
        Phase::Verification => "\
echo 'Reviewing the changes...'
sleep 0.05
if grep -q REVIEWED BUGS.md 2>/dev/null; then
  echo '{\"passed\": true, \"summary\": \"ok\"}'
else
  echo '{\"passed\": false, \"summary\": \"missing test\", \"issues\": [\"add a REVIEWED note\"]}'
fi
"
        .to_string(),
        Phase::Revision => "\
echo 'Applying reviewer feedback...'
printf 'REVIEWED\\n' >> BUGS.md
sleep 0.05
echo '{\"change_summary\": \"Addressed review feedback\", \"files_changed\": [\"BUGS.md\"], \"completion_status\": \"complete\"}'
"
        .to_string(),
        Phase::Exploration | Phase::Combined | Phase::Continuation => "\
echo 'Mock session started'
echo 'EXPLORATION_RESULT: Found one file'
echo ''
sleep 0.05
printf '# Known Bugs\\n\\nmock change\\n' > BUGS.md
echo '{\"change_summary\": \"Touched nothing\", \"files_changed\": [\"BUGS.md\"], \"completion_status\": \"complete\"}'
"
        .to_string(),
    }
}
