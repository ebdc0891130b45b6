/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<i32> for usize {
    fn prechecked_cast(self) -> i32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<usize> for i32 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prechecked_cast_in_range() {
        let x: i32 = 17usize.prechecked_cast();
        assert_eq!(x, 17);
        let y: usize = 508i32.prechecked_cast();
        assert_eq!(y, 508);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_negative() {
        let _: usize = (-1i32).prechecked_cast();
    }
}
