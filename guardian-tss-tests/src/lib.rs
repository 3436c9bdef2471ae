//! Integration tests of `guardian-tss`, see `tests/`
