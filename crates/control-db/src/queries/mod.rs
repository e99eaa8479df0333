pub mod tasks;

// `agent_events`, `gate_results`, `invariants`, and `plans` were the
// teacher's LLM-agent-fleet query modules. They have no counterpart in the
// task-queue domain and are left unreferenced here pending the final
// trim pass; see DESIGN.md.
