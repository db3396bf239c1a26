/// Hands out small integer ids, preferring previously returned ones.
///
/// Two managers fed the same sequence of calls issue the same ids, so peers
/// running their own instance agree on assignment order.
#[derive(Debug, Clone, Default)]
pub struct IdManager {
    next_id: u32,
    returned_ids: Vec<u32>,
}

impl IdManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_id(&mut self) -> u32 {
        if let Some(id) = self.returned_ids.pop() {
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn return_id(&mut self, id: u32) {
        if self.next_id > 0 && id == self.next_id - 1 {
            self.next_id -= 1;
        } else {
            self.returned_ids.push(id);
        }
    }

    pub fn issued_count(&self) -> u32 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashSet;
    use proptest::prelude::*;

    #[test]
    fn test_returned_id_reused_before_growth() {
        let mut manager = IdManager::new();
        assert_eq!(manager.get_id(), 0);
        assert_eq!(manager.get_id(), 1);
        assert_eq!(manager.get_id(), 2);

        manager.return_id(1);
        assert_eq!(manager.get_id(), 1);
        assert_eq!(manager.get_id(), 3);
    }

    #[test]
    fn test_returning_last_id_shrinks_counter() {
        let mut manager = IdManager::new();
        manager.get_id();
        manager.get_id();

        manager.return_id(1);
        assert_eq!(manager.issued_count(), 1);
        assert_eq!(manager.get_id(), 1);
    }

    #[test]
    fn test_fresh_managers_agree_on_first_id() {
        assert_eq!(IdManager::new().get_id(), IdManager::new().get_id());
    }

    #[derive(Debug, Clone)]
    enum Call {
        Get,
        Return(usize),
    }

    fn call_strategy() -> impl Strategy<Value = Call> {
        prop_oneof![
            3 => Just(Call::Get),
            2 => any::<usize>().prop_map(Call::Return),
        ]
    }

    fn replay(calls: &[Call]) -> Vec<u32> {
        let mut manager = IdManager::new();
        let mut outstanding: Vec<u32> = Vec::new();
        let mut issued = Vec::new();

        for call in calls {
            match call {
                Call::Get => {
                    let id = manager.get_id();
                    issued.push(id);
                    outstanding.push(id);
                }
                Call::Return(index) => {
                    if !outstanding.is_empty() {
                        let id = outstanding.swap_remove(index % outstanding.len());
                        manager.return_id(id);
                    }
                }
            }
        }
        issued
    }

    proptest! {
        #[test]
        fn test_id_sequences_are_deterministic(calls in prop::collection::vec(call_strategy(), 0..200)) {
            prop_assert_eq!(replay(&calls), replay(&calls));
        }

        #[test]
        fn test_outstanding_ids_are_unique(calls in prop::collection::vec(call_strategy(), 0..200)) {
            let mut manager = IdManager::new();
            let mut outstanding: AHashSet<u32> = AHashSet::new();
            let mut order: Vec<u32> = Vec::new();

            for call in &calls {
                match call {
                    Call::Get => {
                        let id = manager.get_id();
                        prop_assert!(outstanding.insert(id), "id {} issued twice", id);
                        order.push(id);
                    }
                    Call::Return(index) => {
                        if !order.is_empty() {
                            let id = order.swap_remove(index % order.len());
                            outstanding.remove(&id);
                            manager.return_id(id);
                        }
                    }
                }
            }
        }
    }
}
