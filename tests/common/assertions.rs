//! Custom assertion macros and utilities

/// Assert that a result is ok and return the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a cart's totals agree with its lines
#[macro_export]
macro_rules! assert_consistent {
    ($cart:expr) => {{
        let cart = &$cart;
        let items: u32 = cart.items.iter().map(|item| item.quantity).sum();
        let price: i64 = cart.items.iter().map(|item| item.subtotal).sum();
        assert_eq!(cart.total_items, items, "total_items disagrees with lines");
        assert_eq!(cart.total_price, price, "total_price disagrees with lines");
        assert!(cart.items.iter().all(|item| item.quantity > 0), "zero-quantity line");
    }};
}
