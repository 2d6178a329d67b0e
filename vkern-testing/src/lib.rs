//! Internal testing utilities for the vkern crates.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Table-driven test runner.
///
/// Kernel tests typically check the same property over many shapes, layouts
/// and hyperparameters. The convention is to describe one combination with a
/// `Case` struct deriving `Debug`, build an array of cases and call
/// `test_each` with the test body. Every case runs even if an earlier one
/// fails; afterwards the runner panics with the number of failures and the
/// debug representation of each failing case.
///
/// ```
/// use vkern_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     n: usize,
///     expected_blocks: usize,
/// }
///
/// let cases = [
///     Case { n: 10, expected_blocks: 3 },
///     Case { n: 12, expected_blocks: 3 },
/// ];
///
/// cases.test_each(|case| {
///     assert_eq!(case.n.div_ceil(4), case.expected_blocks);
/// });
/// ```
///
/// Cases and the test closure must be unwind safe, since failures are caught
/// with [`std::panic::catch_unwind`]. Values with interior mutability should
/// be created inside the test closure rather than stored in the case.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Run `test` with a reference to each case.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Run `test` with each case passed by value.
    ///
    /// The debug representation of each case is captured before it is moved
    /// into the test function, so this costs an extra format per case.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

/// Panic with a summary if any cases failed.
fn report_failures(failures: &[String]) {
    assert!(
        failures.is_empty(),
        "{} test cases failed: [{}]",
        failures.len(),
        failures.join(", ")
    );
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<String> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .map(|case| format!("{:?}", case))
            .collect();
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let desc = format!("{:?}", case);
            let test = &test;
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(desc);
            }
        }
        report_failures(&failures);
    }
}

#[cfg(test)]
mod tests {
    use super::TestCases;

    #[derive(Clone, Debug)]
    struct Case {
        x: i32,
    }

    #[test]
    fn test_cases_pass() {
        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.clone().test_each(|case| assert!(case.x > 0));
        cases.test_each_value(|case| assert!(case.x > 0));
    }

    #[test]
    #[should_panic(expected = "1 test cases failed: [Case { x: 2 }]")]
    fn test_each_reports_failing_case() {
        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each(|case| assert_eq!(case.x, 1));
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_each_value_reports_failures() {
        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each_value(|_| panic!("always fails"));
    }
}
