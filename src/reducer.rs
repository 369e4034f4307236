//! Reducer trait, composition, and the identity reducer.

use std::fmt;

/// A pure state transition: `(state, action) -> next state`.
///
/// # Contract
///
/// - [`reduce`](Reducer::reduce) must be deterministic: equal inputs yield
///   equal outputs. No I/O, no hidden state.
/// - It must be total for every action the application dispatches.
///   Actions the reducer does not care about return `state` unchanged.
///   A panic is treated as a fault and poisons the owning store.
///
/// Any `Fn(S, &A) -> S` closure is a reducer, so small applications rarely
/// need to implement this trait by hand.
pub trait Reducer<S, A>: Send + Sync + 'static {
    /// Compute the next state from the current one and an action.
    fn reduce(&self, state: S, action: &A) -> S;
}

impl<S, A, F> Reducer<S, A> for F
where
    F: Fn(S, &A) -> S + Send + Sync + 'static,
{
    fn reduce(&self, state: S, action: &A) -> S {
        self(state, action)
    }
}

/// A reducer built from an ordered list of child reducers.
///
/// Each action is folded through the children left to right: the output of
/// one child is the input state of the next.
///
/// # Examples
///
/// ```
/// use statefold::{CompositeReducer, Reducer};
///
/// let double = |s: i32, _: &()| s * 2;
/// let add_one = |s: i32, _: &()| s + 1;
///
/// let composite: CompositeReducer<i32, ()> = CompositeReducer::new().with(double).with(add_one);
/// assert_eq!(composite.reduce(5, &()), 11);
/// ```
pub struct CompositeReducer<S, A> {
    reducers: Vec<Box<dyn Reducer<S, A>>>,
}

impl<S, A> CompositeReducer<S, A> {
    /// Create an empty composite, which behaves as the identity.
    pub fn new() -> Self {
        Self {
            reducers: Vec::new(),
        }
    }

    /// Append a child reducer. Children run in the order they are added.
    pub fn with(mut self, reducer: impl Reducer<S, A>) -> Self {
        self.reducers.push(Box::new(reducer));
        self
    }

    /// Append an already boxed child reducer.
    pub fn push(&mut self, reducer: Box<dyn Reducer<S, A>>) {
        self.reducers.push(reducer);
    }

    /// Number of child reducers.
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    /// Returns `true` if no child reducers are registered.
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

impl<S, A> Default for CompositeReducer<S, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> From<Vec<Box<dyn Reducer<S, A>>>> for CompositeReducer<S, A> {
    fn from(reducers: Vec<Box<dyn Reducer<S, A>>>) -> Self {
        Self { reducers }
    }
}

// Manual `Debug` because `dyn Reducer` is not `Debug`.
impl<S, A> fmt::Debug for CompositeReducer<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeReducer")
            .field("len", &self.reducers.len())
            .finish()
    }
}

impl<S, A> Reducer<S, A> for CompositeReducer<S, A>
where
    S: 'static,
    A: 'static,
{
    fn reduce(&self, state: S, action: &A) -> S {
        self.reducers
            .iter()
            .fold(state, |acc, reducer| reducer.reduce(acc, action))
    }
}

/// A reducer that always returns the state it was given.
///
/// Useful as a placeholder, or for exercising store wiring without
/// mutating state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReducer;

impl<S, A> Reducer<S, A> for NoOpReducer {
    fn reduce(&self, state: S, _action: &A) -> S {
        state
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Reducer;

    /// A simple counter state used across the crate's tests.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub(crate) struct CounterState {
        pub counter: i64,
    }

    impl CounterState {
        pub(crate) fn at(counter: i64) -> Self {
            Self { counter }
        }
    }

    /// Actions understood by [`CounterReducer`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum CounterAction {
        Increment(i64),
        Decrement(i64),
        /// Panics inside the reducer.
        Explode,
    }

    pub(crate) struct CounterReducer;

    impl Reducer<CounterState, CounterAction> for CounterReducer {
        fn reduce(&self, state: CounterState, action: &CounterAction) -> CounterState {
            match action {
                CounterAction::Increment(by) => CounterState::at(state.counter + by),
                CounterAction::Decrement(by) => CounterState::at(state.counter - by),
                CounterAction::Explode => panic!("counter exploded"),
            }
        }
    }
}
