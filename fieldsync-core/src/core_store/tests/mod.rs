/*
    Integration tests for core_store subsystem

    Test suite covering:
    - Merge convergence properties of record state
    - Manager write path (local edits, remote merges, acknowledgements)
    - Storage persistence across reopen
*/

pub mod convergence_tests;
