/// A state that consumes one input and yields the next state, leaving any
/// side-channel result in `Context` for the caller to act on.
pub trait FiniteStateMachine {
    type Input;
    type Context;

    #[must_use]
    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self;
}
