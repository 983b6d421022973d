// Licensed under the MIT License.

//! Controller-level tests.
