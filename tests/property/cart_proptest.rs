//! Properties of mutations and optimistic state

use cartsync::offline::OptimisticManager;
use cartsync::shared::config::OptimisticConfig;
use cartsync::shared::{ApiError, Cart, CartMutation};
use proptest::prelude::*;

const PRODUCTS: &[&str] = &["book", "pen", "lamp", "mug"];

fn mutation() -> impl Strategy<Value = CartMutation> {
    let product = prop::sample::select(PRODUCTS).prop_map(str::to_string);
    prop_oneof![
        3 => (product.clone(), 1u32..5, 1i64..10_000).prop_map(|(product_id, quantity, unit_price)| {
            CartMutation::AddItem { product_id, quantity, unit_price }
        }),
        2 => (product.clone(), 0u32..6).prop_map(|(product_id, quantity)| {
            CartMutation::UpdateQuantity { product_id, quantity }
        }),
        1 => product.prop_map(|product_id| CartMutation::RemoveItem { product_id }),
        1 => Just(CartMutation::ClearCart),
    ]
}

fn totals_hold(cart: &Cart) -> bool {
    let items: u32 = cart.items.iter().map(|item| item.quantity).sum();
    let price: i64 = cart.items.iter().map(|item| item.subtotal).sum();
    cart.total_items == items && cart.total_price == price && cart.items.iter().all(|item| item.quantity > 0)
}

proptest! {
    #[test]
    fn test_totals_hold_after_every_mutation(mutations in prop::collection::vec(mutation(), 0..40)) {
        let mut cart = Cart::empty("s1");
        for mutation in &mutations {
            cart = mutation.apply_to(&cart);
            prop_assert!(totals_hold(&cart), "totals broken after {:?}: {:?}", mutation, cart);
        }
    }

    #[test]
    fn test_rollback_replays_remaining_operations(
        mutations in prop::collection::vec(mutation(), 1..10),
        pick in any::<prop::sample::Index>(),
    ) {
        let base = Cart::empty("s1");
        let config = OptimisticConfig { max_pending_operations: 16, ..OptimisticConfig::default() };
        let mut manager = OptimisticManager::new(base.clone(), &config);

        let ids: Vec<_> = mutations
            .iter()
            .map(|mutation| manager.apply_optimistic_update(mutation.clone()).unwrap().operation_id)
            .collect();
        let failed = pick.index(ids.len());
        let rollback = manager.fail_operation(ids[failed], ApiError::rejected(409, "no")).unwrap();

        let expected = mutations
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != failed)
            .fold(base, |cart, (_, mutation)| mutation.apply_to(&cart));
        prop_assert_eq!(&rollback.state.items, &expected.items);
        prop_assert_eq!(rollback.state.total_price, expected.total_price);
        prop_assert_eq!(manager.pending_count(), mutations.len() - 1);
        prop_assert!(totals_hold(&manager.current_state()));
    }
}
