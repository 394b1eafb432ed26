use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: IngestionState,
    initial: Ready,
    states: [Ready, Prepared, Resumed, Extracted, Finalized, Failed],
    events {
        prepare { transition: { from: Ready, to: Prepared } }
        resume { transition: { from: Prepared, to: Resumed } }
        extract { transition: { from: Resumed, to: Extracted } }
        finalize { transition: { from: Extracted, to: Finalized } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Prepared, to: Failed }
            transition: { from: Resumed, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Finalized, to: Failed }
        }
    }
}

pub fn ready() -> IngestionMachine<(), Ready> {
    IngestionMachine::new(())
}
